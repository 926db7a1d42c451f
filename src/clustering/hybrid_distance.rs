// src/clustering/hybrid_distance.rs

//! Pairwise distances for one partition of complaints.
//!
//! The hybrid metric blends embedding cosine similarity with keyword Jaccard
//! similarity; the text metric (used by the last cascade stage) compares the
//! raw complaint text character by character. Both produce a symmetric matrix
//! clipped to `[0, 1]` with a zero diagonal. Cost is O(N²) in the partition
//! size, which the cascade keeps bounded.

use log::{debug, warn};
use ndarray::Array2;
use std::collections::{HashMap, HashSet};

use crate::utils::candle::cosine_similarity_matrix;

/// Jaccard similarity of two keyword sets; two empty sets score 0.
pub fn jaccard_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn is_well_formed(v: &[f32]) -> bool {
    !v.is_empty() && v.iter().all(|x| x.is_finite())
}

/// Brings every embedding to one common dimension.
///
/// The common dimension is the most frequent length among well-formed vectors
/// (ties go to the larger length), or `fallback_dim` when none is well-formed.
/// Empty, non-finite or wrong-length vectors become zero vectors, so a bad
/// record still occupies its row and keeps its identity.
pub fn coerce_embeddings(embeddings: &[Vec<f32>], fallback_dim: usize) -> Vec<Vec<f32>> {
    let mut length_counts: HashMap<usize, usize> = HashMap::new();
    for v in embeddings.iter().filter(|v| is_well_formed(v)) {
        *length_counts.entry(v.len()).or_insert(0) += 1;
    }
    let dim = length_counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
        .map(|(len, _)| len)
        .unwrap_or(fallback_dim);

    let mut coerced_count = 0usize;
    let coerced: Vec<Vec<f32>> = embeddings
        .iter()
        .map(|v| {
            if v.len() == dim && is_well_formed(v) {
                v.clone()
            } else {
                coerced_count += 1;
                vec![0.0; dim]
            }
        })
        .collect();
    if coerced_count > 0 {
        warn!(
            "Coerced {} of {} embeddings to a {}-dim zero vector",
            coerced_count,
            embeddings.len(),
            dim
        );
    }
    coerced
}

/// `distance = clip(1 − (α·cos + (1−α)·jaccard), 0, 1)` for every pair.
pub fn hybrid_distance_matrix(
    embeddings: &[Vec<f32>],
    keywords: &[HashSet<String>],
    alpha: f64,
    fallback_dim: usize,
) -> Array2<f64> {
    let n = embeddings.len();
    debug_assert_eq!(n, keywords.len());
    let alpha = alpha.clamp(0.0, 1.0);

    let vectors = coerce_embeddings(embeddings, fallback_dim);
    let emb_sim = cosine_similarity_matrix(&vectors, &vectors);

    let mut dist = Array2::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let key_sim = jaccard_similarity(&keywords[i], &keywords[j]);
            let similarity = alpha * emb_sim[[i, j]] + (1.0 - alpha) * key_sim;
            let d = (1.0 - similarity).clamp(0.0, 1.0);
            dist[[i, j]] = d;
            dist[[j, i]] = d;
        }
    }
    debug!("Computed {}x{} hybrid distance matrix (alpha={:.2})", n, n, alpha);
    dist
}

/// `distance = clip(1 − cos, 0, 1)` for every pair, embeddings only.
pub fn cosine_distance_matrix(embeddings: &[Vec<f32>], fallback_dim: usize) -> Array2<f64> {
    let n = embeddings.len();
    let vectors = coerce_embeddings(embeddings, fallback_dim);
    let sim = cosine_similarity_matrix(&vectors, &vectors);
    let mut dist = Array2::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let d = (1.0 - sim[[i, j]]).clamp(0.0, 1.0);
            dist[[i, j]] = d;
            dist[[j, i]] = d;
        }
    }
    dist
}

/// Length of the longest common subsequence of two char slices.
fn lcs_length(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Character alignment ratio `2·LCS / (|a| + |b|)`; two empty strings are identical.
pub fn text_alignment_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * lcs_length(&a, &b) as f64 / total as f64
}

/// `distance = 1 − text_alignment_ratio` for every pair.
pub fn text_distance_matrix<S: AsRef<str>>(texts: &[S]) -> Array2<f64> {
    let n = texts.len();
    let mut dist = Array2::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let d = (1.0 - text_alignment_ratio(texts[i].as_ref(), texts[j].as_ref())).clamp(0.0, 1.0);
            dist[[i, j]] = d;
            dist[[j, i]] = d;
        }
    }
    dist
}
