// src/clustering/quality.rs

use anyhow::{Context, Result};
use log::{info, warn};
use ndarray::Array2;
use std::collections::{BTreeMap, HashSet};

use crate::clustering::db::fetch_labeled_embeddings;
use crate::clustering::hybrid_distance::coerce_embeddings;
use crate::models::stats_models::QualityReport;
use crate::utils::candle::cosine_similarity_matrix;
use crate::utils::db_connect::PgPool;

/// Rows of cosine similarities held at once by the corpus-wide evaluator.
const SILHOUETTE_BLOCK_ROWS: usize = 512;

/// Maps labels to dense indices in first-seen order and counts each label.
fn dense_labels<L: Copy + Ord>(labels: &[L]) -> (Vec<usize>, Vec<usize>) {
    let mut slots: BTreeMap<L, usize> = BTreeMap::new();
    let mut dense = Vec::with_capacity(labels.len());
    let mut counts: Vec<usize> = Vec::new();
    for label in labels {
        let next = slots.len();
        let slot = *slots.entry(*label).or_insert(next);
        if slot == counts.len() {
            counts.push(0);
        }
        counts[slot] += 1;
        dense.push(slot);
    }
    (dense, counts)
}

/// One point's silhouette from its summed distance to every label (itself
/// excluded). A point alone in its cluster scores 0.
fn point_silhouette(sums: &[f64], counts: &[usize], own: usize) -> f64 {
    if counts[own] < 2 {
        return 0.0;
    }
    let a = sums[own] / (counts[own] - 1) as f64;
    let b = sums
        .iter()
        .zip(counts)
        .enumerate()
        .filter(|(label, _)| *label != own)
        .map(|(_, (sum, count))| sum / *count as f64)
        .fold(f64::INFINITY, f64::min);
    let denom = a.max(b);
    if denom > 0.0 && denom.is_finite() {
        (b - a) / denom
    } else {
        0.0
    }
}

/// Mean silhouette coefficient over a precomputed distance matrix.
///
/// For each point, `a` is its mean distance to the rest of its own cluster
/// and `b` the smallest mean distance to any other cluster; the point scores
/// `(b − a) / max(a, b)`. Points alone in their cluster score 0.
///
/// Returns `None` unless there are at least two distinct labels and fewer
/// distinct labels than points.
pub fn silhouette_score_precomputed<L>(dist: &Array2<f64>, labels: &[L]) -> Option<f64>
where
    L: Copy + Ord,
{
    let n = labels.len();
    if n < 2 || dist.nrows() != n || dist.ncols() != n {
        return None;
    }
    let (dense, counts) = dense_labels(labels);
    if counts.len() < 2 || counts.len() >= n {
        return None;
    }

    let mut sums = vec![0.0; counts.len()];
    let mut total = 0.0;
    for i in 0..n {
        sums.fill(0.0);
        for j in (0..n).filter(|&j| j != i) {
            sums[dense[j]] += dist[[i, j]];
        }
        total += point_silhouette(&sums, &counts, dense[i]);
    }
    Some(total / n as f64)
}

/// Cosine-distance silhouette over `vectors`, which must share one dimension.
/// Similarities are computed `block_rows` rows at a time against the whole
/// set, so memory stays at `block_rows x n` however large the corpus is.
fn cosine_silhouette(vectors: &[Vec<f32>], labels: &[i64], block_rows: usize) -> Option<f64> {
    let n = labels.len();
    if n < 2 || vectors.len() != n {
        return None;
    }
    let (dense, counts) = dense_labels(labels);
    if counts.len() < 2 || counts.len() >= n {
        return None;
    }

    let block_rows = block_rows.max(1);
    let mut sums = vec![0.0; counts.len()];
    let mut total = 0.0;
    for start in (0..n).step_by(block_rows) {
        let end = (start + block_rows).min(n);
        let sim = cosine_similarity_matrix(&vectors[start..end], vectors);
        for (offset, row) in sim.outer_iter().enumerate() {
            let i = start + offset;
            sums.fill(0.0);
            for (j, s) in row.iter().enumerate().filter(|(j, _)| *j != i) {
                sums[dense[j]] += (1.0 - s).max(0.0);
            }
            total += point_silhouette(&sums, &counts, dense[i]);
        }
    }
    Some(total / n as f64)
}

/// Cosine silhouette over labeled embeddings, reported as a health percentage.
///
/// Returns `None` when fewer than two distinct labels or two points exist.
pub fn evaluate_quality(labels: &[i64], embeddings: &[Vec<f32>], fallback_dim: usize) -> Option<QualityReport> {
    if labels.len() != embeddings.len() {
        warn!(
            "Quality evaluation skipped: {} labels vs {} embeddings",
            labels.len(),
            embeddings.len()
        );
        return None;
    }
    let distinct_labels = labels.iter().collect::<HashSet<_>>().len();
    if distinct_labels < 2 || labels.len() < 2 {
        return None;
    }
    let vectors = coerce_embeddings(embeddings, fallback_dim);
    let silhouette = cosine_silhouette(&vectors, labels, SILHOUETTE_BLOCK_ROWS)?;
    Some(QualityReport {
        labeled_points: labels.len(),
        distinct_labels,
        silhouette,
        accuracy_pct: (silhouette + 1.0) / 2.0 * 100.0,
    })
}

/// Reads every labeled complaint and logs the corpus-wide quality figure.
/// Read-only; never touches incident or linkage rows.
pub async fn run_quality_evaluation(pool: &PgPool, fallback_dim: usize) -> Result<Option<QualityReport>> {
    info!("📊 Evaluating clustering quality over all labeled complaints...");
    let (labels, embeddings) = fetch_labeled_embeddings(pool)
        .await
        .context("Failed to load labeled embeddings for quality evaluation")?;

    let report = evaluate_quality(&labels, &embeddings, fallback_dim);
    match &report {
        Some(r) => info!(
            "✅ Quality: silhouette {:.4} over {} complaints / {} incidents -> accuracy index {:.2}%",
            r.silhouette, r.labeled_points, r.distinct_labels, r.accuracy_pct
        ),
        None => info!("💡 Quality evaluation skipped: insufficient data ({} labeled complaints)", labels.len()),
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silhouette_two_tight_groups() {
        // Points 0,1 and 2,3 are close pairs far from each other.
        let dist = Array2::from_shape_fn((4, 4), |(i, j)| {
            if i == j {
                0.0
            } else if (i < 2) == (j < 2) {
                0.1
            } else {
                0.9
            }
        });
        let score = silhouette_score_precomputed(&dist, &[0, 0, 1, 1]).unwrap();
        assert!((score - (0.8 / 0.9)).abs() < 1e-12);
    }

    #[test]
    fn test_silhouette_singleton_cluster_scores_zero() {
        let dist = Array2::from_shape_fn((3, 3), |(i, j)| if i == j { 0.0 } else if i + j == 1 { 0.2 } else { 1.0 });
        // Points 0 and 1 score (1.0 - 0.2) / 1.0; point 2 is alone and scores 0.
        let score = silhouette_score_precomputed(&dist, &[5i64, 5, 9]).unwrap();
        assert!((score - (0.8 * 2.0 / 3.0)).abs() < 1e-12);
    }

    #[test]
    fn test_silhouette_not_computable() {
        let dist = Array2::zeros((3, 3));
        assert!(silhouette_score_precomputed(&dist, &[1, 1, 1]).is_none());
        assert!(silhouette_score_precomputed(&dist, &[1, 2, 3]).is_none());
        assert!(silhouette_score_precomputed(&Array2::zeros((1, 1)), &[1]).is_none());
    }

    #[test]
    fn test_evaluate_quality_accuracy_percentage() {
        let labels = vec![10, 10, 20, 20];
        let embeddings = vec![vec![1.0, 0.0], vec![1.0, 0.0], vec![0.0, 1.0], vec![0.0, 1.0]];
        let report = evaluate_quality(&labels, &embeddings, 2).unwrap();
        assert_eq!(report.labeled_points, 4);
        assert_eq!(report.distinct_labels, 2);
        assert!((report.silhouette - 1.0).abs() < 1e-6);
        assert!((report.accuracy_pct - 100.0).abs() < 1e-4);
    }

    #[test]
    fn test_evaluate_quality_insufficient_data() {
        assert!(evaluate_quality(&[1, 1], &[vec![1.0], vec![1.0]], 1).is_none());
        assert!(evaluate_quality(&[], &[], 1).is_none());
        assert!(evaluate_quality(&[1, 2], &[vec![1.0]], 1).is_none());
    }

    #[test]
    fn test_blocked_cosine_silhouette_matches_full_matrix() {
        let vectors = vec![
            vec![1.0, 0.1, 0.0],
            vec![0.9, 0.2, 0.1],
            vec![0.1, 1.0, 0.0],
            vec![0.0, 0.9, 0.3],
            vec![0.2, 0.8, 0.1],
            vec![0.0, 0.1, 1.0],
            vec![0.1, 0.0, 0.9],
        ];
        let labels = [7i64, 7, 3, 3, 3, 9, 9];

        let mut dist = cosine_similarity_matrix(&vectors, &vectors).mapv(|s| (1.0 - s).max(0.0));
        dist.diag_mut().fill(0.0);
        let full = silhouette_score_precomputed(&dist, &labels).unwrap();

        for block_rows in [1, 2, 3, 7, 64] {
            let blocked = cosine_silhouette(&vectors, &labels, block_rows).unwrap();
            assert!((blocked - full).abs() < 1e-5, "block {}: {} vs {}", block_rows, blocked, full);
        }
        assert!(full > 0.5);
    }
}
