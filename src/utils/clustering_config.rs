// src/utils/clustering_config.rs
use log::{info, warn};
use std::env;
use std::str::FromStr;

use crate::models::complaint::SingletonPolicy;

/// Every tunable of the batch cascade and the incremental matcher.
///
/// The three batch radii are independent knobs. The defaults happen to be
/// ordered `eps_refine < eps_coarse < eps_text`, but nothing relies on it.
#[derive(Debug, Clone)]
pub struct ClusteringConfig {
    /// Blend weight of embedding cosine vs. keyword Jaccard in Pass 1 and refinement.
    pub alpha: f64,
    pub eps_coarse: f64,
    pub eps_refine: f64,
    pub eps_text: f64,
    pub min_samples: usize,
    pub large_cluster_threshold: usize,
    pub match_threshold: f64,
    pub match_embedding_weight: f64,
    pub residual_eps: f64,
    pub embedding_dim: usize,
    pub batch_singleton_policy: SingletonPolicy,
    pub residual_singleton_policy: SingletonPolicy,
    pub batch_link_score: f64,
    pub title_max_len: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            alpha: 0.7,
            eps_coarse: 0.20,
            eps_refine: 0.15,
            eps_text: 0.25,
            min_samples: 2,
            large_cluster_threshold: 30,
            match_threshold: 0.05,
            match_embedding_weight: 0.5,
            residual_eps: 0.05,
            embedding_dim: 1024,
            batch_singleton_policy: SingletonPolicy::OpenIncident,
            residual_singleton_policy: SingletonPolicy::LeaveUnassigned,
            batch_link_score: 0.95,
            title_max_len: 150,
        }
    }
}

fn env_or<T: FromStr + Copy + std::fmt::Debug>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!("Invalid value '{}' for {}, using default {:?}", raw, key, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn unit_interval(key: &str, value: f64, default: f64) -> f64 {
    if (0.0..=1.0).contains(&value) {
        value
    } else {
        warn!("{}={} is outside [0, 1], using default {}", key, value, default);
        default
    }
}

impl ClusteringConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let min_samples = env_or("CLUSTER_MIN_SAMPLES", d.min_samples).max(1);
        Self {
            alpha: unit_interval("CLUSTER_ALPHA", env_or("CLUSTER_ALPHA", d.alpha), d.alpha),
            eps_coarse: env_or("CLUSTER_EPS_COARSE", d.eps_coarse),
            eps_refine: env_or("CLUSTER_EPS_REFINE", d.eps_refine),
            eps_text: env_or("CLUSTER_EPS_TEXT", d.eps_text),
            min_samples,
            large_cluster_threshold: env_or("CLUSTER_LARGE_THRESHOLD", d.large_cluster_threshold),
            match_threshold: env_or("MATCH_THRESHOLD", d.match_threshold),
            match_embedding_weight: unit_interval(
                "MATCH_EMBEDDING_WEIGHT",
                env_or("MATCH_EMBEDDING_WEIGHT", d.match_embedding_weight),
                d.match_embedding_weight,
            ),
            residual_eps: env_or("RESIDUAL_EPS", d.residual_eps),
            embedding_dim: env_or("EMBEDDING_DIM", d.embedding_dim),
            batch_singleton_policy: env_or("BATCH_SINGLETON_POLICY", d.batch_singleton_policy),
            residual_singleton_policy: env_or(
                "RESIDUAL_SINGLETON_POLICY",
                d.residual_singleton_policy,
            ),
            batch_link_score: env_or("BATCH_LINK_SCORE", d.batch_link_score),
            title_max_len: env_or("TITLE_MAX_LEN", d.title_max_len).max(1),
        }
    }

    pub fn log_config(&self) {
        info!("🧩 Clustering configuration:");
        info!(
            "   Batch cascade: alpha={:.2}, eps coarse={:.3} / refine={:.3} / text={:.3}, min_samples={}, large cluster >= {}",
            self.alpha,
            self.eps_coarse,
            self.eps_refine,
            self.eps_text,
            self.min_samples,
            self.large_cluster_threshold
        );
        info!(
            "   Incremental: match threshold={:.3} (embedding weight {:.2}), residual eps={:.3}",
            self.match_threshold, self.match_embedding_weight, self.residual_eps
        );
        info!(
            "   Singleton policy: batch={}, residual={}",
            self.batch_singleton_policy.as_str(),
            self.residual_singleton_policy.as_str()
        );
        if !(self.eps_refine < self.eps_coarse && self.eps_coarse < self.eps_text) {
            warn!("   Radii are not ordered refine < coarse < text; continuing as configured");
        }
    }
}
