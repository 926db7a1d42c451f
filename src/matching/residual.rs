// src/matching/residual.rs

use log::debug;
use std::collections::HashSet;

use crate::clustering::create_clusters::incident_draft;
use crate::clustering::dbscan::dbscan_precomputed;
use crate::clustering::hybrid_distance::cosine_distance_matrix;
use crate::matching::centroid::IncidentSignature;
use crate::models::complaint::{ComplaintRecord, IncidentDraft, SingletonPolicy};
use crate::utils::candle::cosine_similarity;
use crate::utils::clustering_config::ClusteringConfig;

/// New incidents formed from one cycle's rejected pool.
#[derive(Debug, Clone, Default)]
pub struct ResidualOutcome {
    pub drafts: Vec<IncidentDraft>,
    /// Complaints left unassigned this cycle; a later cycle sees them again.
    pub deferred: Vec<i64>,
}

impl ResidualOutcome {
    pub fn cluster_count(&self) -> usize {
        self.drafts.iter().filter(|d| !d.is_noise).count()
    }

    pub fn noise_count(&self) -> usize {
        self.drafts.iter().filter(|d| d.is_noise).count()
    }
}

/// Mean cosine similarity of the members to their own centroid.
fn cohesion(members: &[&ComplaintRecord], fallback_dim: usize) -> f64 {
    let embeddings: Vec<Vec<f32>> = members.iter().map(|m| m.embedding.clone()).collect();
    match IncidentSignature::from_members(0, &embeddings, &[], None, fallback_dim) {
        Some(sig) => {
            embeddings
                .iter()
                .map(|e| cosine_similarity(e, &sig.centroid))
                .sum::<f64>()
                / embeddings.len() as f64
        }
        None => 0.0,
    }
}

/// Clusters the rejected pool with a strict cosine radius.
///
/// Pools of fewer than two items are not clustered. Items no cluster
/// accepts, including a lone pool item, follow
/// `config.residual_singleton_policy`: deferred by default, or opened as
/// noise-tagged singletons.
///
/// Arguments:
/// * `pool` - Rejected complaints, ascending by id.
/// * `config` - Residual radius, policy and title settings.
/// * `titles_in_use` - Titles already taken.
///
/// Returns:
/// The residual outcome and the grown title set.
pub fn cluster_residual_pool(
    pool: &[&ComplaintRecord],
    config: &ClusteringConfig,
    titles_in_use: HashSet<String>,
) -> (ResidualOutcome, HashSet<String>) {
    let mut outcome = ResidualOutcome::default();
    let mut titles = titles_in_use;

    let (clusters, leftovers): (Vec<Vec<usize>>, Vec<usize>) = if pool.len() < 2 {
        (Vec::new(), (0..pool.len()).collect())
    } else {
        let embeddings: Vec<Vec<f32>> = pool.iter().map(|r| r.embedding.clone()).collect();
        let dist = cosine_distance_matrix(&embeddings, config.embedding_dim);
        let labels = dbscan_precomputed(&dist, config.residual_eps, config.min_samples);
        debug!(
            "Residual pool of {}: {} clusters, {} noise",
            pool.len(),
            labels.n_clusters,
            labels.noise().len()
        );
        (labels.clusters(), labels.noise())
    };

    for cluster in &clusters {
        let members: Vec<&ComplaintRecord> = cluster.iter().map(|&i| pool[i]).collect();
        let score = cohesion(&members, config.embedding_dim);
        let (draft, next) = incident_draft(&members, false, score, config.title_max_len, titles);
        titles = next;
        outcome.drafts.push(draft);
    }

    for idx in leftovers {
        let record = pool[idx];
        match config.residual_singleton_policy {
            SingletonPolicy::LeaveUnassigned => outcome.deferred.push(record.id),
            SingletonPolicy::OpenIncident => {
                let (draft, next) = incident_draft(&[record], true, 1.0, config.title_max_len, titles);
                titles = next;
                outcome.drafts.push(draft);
            }
        }
    }

    (outcome, titles)
}
