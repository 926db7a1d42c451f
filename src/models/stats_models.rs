// src/models/stats_models.rs

use serde::Serialize;

/// Counters for one batch (bootstrap) clustering run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchClusteringStats {
    pub records_loaded: usize,
    pub records_skipped: usize,
    pub partitions_processed: usize,
    pub partitions_failed: usize,
    /// Multi-member incidents produced by Pass 3.
    pub clusters_created: usize,
    /// Singleton incidents opened for unclusterable items.
    pub noise_incidents: usize,
    /// Items left unassigned because the singleton policy said so.
    pub records_unassigned: usize,
    pub silhouette_scores: Vec<f64>,
}

impl BatchClusteringStats {
    pub fn incidents_created(&self) -> usize {
        self.clusters_created + self.noise_incidents
    }

    /// Mean of the per-group Pass-3 silhouettes, 0.0 when none were computable.
    pub fn average_silhouette(&self) -> f64 {
        if self.silhouette_scores.is_empty() {
            0.0
        } else {
            self.silhouette_scores.iter().sum::<f64>() / self.silhouette_scores.len() as f64
        }
    }

    pub fn verdict(&self) -> &'static str {
        let avg = self.average_silhouette();
        if avg > 0.5 {
            "excellent: clusters are tightly separated"
        } else if avg > 0.3 {
            "good: varied complaints are reasonably separated"
        } else {
            "low: data is fragmented or collapsed into few large incidents"
        }
    }
}

/// Counters for one incremental cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IncrementalStats {
    pub records_pending: usize,
    pub records_skipped: usize,
    pub open_incidents: usize,
    pub assigned_to_existing: usize,
    pub residual_pool: usize,
    pub new_incidents: usize,
    pub new_noise_incidents: usize,
    pub records_deferred: usize,
    /// Match or residual transactions that were rolled back.
    pub transactions_failed: usize,
}

/// Advisory clustering-health figure over the whole labeled corpus.
#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub labeled_points: usize,
    pub distinct_labels: usize,
    pub silhouette: f64,
    pub accuracy_pct: f64,
}

/// Stats persisted on the run-metadata row at the end of a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RunStats {
    Batch {
        reset: bool,
        stats: BatchClusteringStats,
        average_silhouette: f64,
        processing_time_secs: f64,
    },
    Incremental {
        stats: IncrementalStats,
        quality: Option<QualityReport>,
        processing_time_secs: f64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_silhouette_and_verdict() {
        let mut stats = BatchClusteringStats::default();
        assert_eq!(stats.average_silhouette(), 0.0);
        assert!(stats.verdict().starts_with("low"));

        stats.silhouette_scores = vec![0.4, 0.8];
        assert!((stats.average_silhouette() - 0.6).abs() < 1e-12);
        assert!(stats.verdict().starts_with("excellent"));

        stats.silhouette_scores = vec![0.35];
        assert!(stats.verdict().starts_with("good"));
    }

    #[test]
    fn test_incidents_created_counts_both_kinds() {
        let stats = BatchClusteringStats {
            clusters_created: 4,
            noise_incidents: 3,
            ..Default::default()
        };
        assert_eq!(stats.incidents_created(), 7);
    }

    #[test]
    fn test_run_stats_serializes_mode_tag() {
        let run = RunStats::Incremental {
            stats: IncrementalStats::default(),
            quality: None,
            processing_time_secs: 1.5,
        };
        let value = serde_json::to_value(&run).unwrap();
        assert_eq!(value["mode"], "incremental");
        assert_eq!(value["processing_time_secs"], 1.5);
    }
}
