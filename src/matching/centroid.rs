// src/matching/centroid.rs

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashSet;

use crate::clustering::hybrid_distance::{coerce_embeddings, jaccard_similarity};
use crate::utils::candle::cosine_similarity;

/// Live matching state of one open incident. Both the centroid and the
/// keyword signature are derived from membership only.
#[derive(Debug, Clone)]
pub struct IncidentSignature {
    pub incident_id: i64,
    pub centroid: Vec<f32>,
    /// Union of the members' cleaned keywords. Only ever grows.
    pub keyword_signature: HashSet<String>,
    pub member_count: usize,
    pub closed_at: Option<NaiveDateTime>,
}

impl IncidentSignature {
    /// Computes the signature from the current members, or `None` when there
    /// are no members to derive it from.
    pub fn from_members(
        incident_id: i64,
        embeddings: &[Vec<f32>],
        keyword_sets: &[HashSet<String>],
        closed_at: Option<NaiveDateTime>,
        fallback_dim: usize,
    ) -> Option<Self> {
        if embeddings.is_empty() {
            return None;
        }
        let vectors = coerce_embeddings(embeddings, fallback_dim);
        let dim = vectors[0].len();
        let mut centroid = vec![0.0f32; dim];
        for v in &vectors {
            for (c, x) in centroid.iter_mut().zip(v.iter()) {
                *c += *x;
            }
        }
        let n = vectors.len() as f32;
        centroid.iter_mut().for_each(|c| *c /= n);

        Some(Self {
            incident_id,
            centroid,
            keyword_signature: keyword_sets.iter().flatten().cloned().collect(),
            member_count: vectors.len(),
            closed_at,
        })
    }

    /// `w·cos(embedding, centroid) + (1−w)·jaccard(keywords, signature)`.
    pub fn score(&self, embedding: &[f32], keywords: &HashSet<String>, embedding_weight: f64) -> f64 {
        embedding_weight * cosine_similarity(embedding, &self.centroid)
            + (1.0 - embedding_weight) * jaccard_similarity(keywords, &self.keyword_signature)
    }

    /// Adds one member: running-mean centroid, keyword union, later closedAt.
    /// A malformed or wrong-length embedding counts as a zero vector.
    pub fn absorb(&mut self, embedding: &[f32], keywords: &HashSet<String>, received_at: NaiveDateTime) {
        let usable = embedding.len() == self.centroid.len() && embedding.iter().all(|x| x.is_finite());
        let next_count = (self.member_count + 1) as f32;
        for (i, c) in self.centroid.iter_mut().enumerate() {
            let x = if usable { embedding[i] } else { 0.0 };
            *c += (x - *c) / next_count;
        }
        self.member_count += 1;
        self.keyword_signature.extend(keywords.iter().cloned());
        self.closed_at = Some(match self.closed_at {
            Some(current) if current >= received_at => current,
            _ => received_at,
        });
    }
}

/// Best-scoring incident for one complaint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub incident_id: i64,
    pub score: f64,
}

/// All open incidents, kept in ascending id order so ties resolve to the
/// lowest id.
#[derive(Debug, Clone, Default)]
pub struct IncidentIndex {
    signatures: Vec<IncidentSignature>,
}

impl IncidentIndex {
    pub fn new(mut signatures: Vec<IncidentSignature>) -> Self {
        signatures.sort_by_key(|s| s.incident_id);
        signatures.dedup_by_key(|s| s.incident_id);
        Self { signatures }
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn signatures(&self) -> &[IncidentSignature] {
        &self.signatures
    }

    pub fn get(&self, incident_id: i64) -> Option<&IncidentSignature> {
        self.signatures
            .binary_search_by_key(&incident_id, |s| s.incident_id)
            .ok()
            .map(|idx| &self.signatures[idx])
    }

    /// Highest-scoring incident; on equal scores the lower id wins.
    pub fn best_match(
        &self,
        embedding: &[f32],
        keywords: &HashSet<String>,
        embedding_weight: f64,
    ) -> Option<MatchCandidate> {
        let mut best: Option<MatchCandidate> = None;
        for signature in &self.signatures {
            let score = signature.score(embedding, keywords, embedding_weight);
            if best.map_or(true, |b| score > b.score) {
                best = Some(MatchCandidate {
                    incident_id: signature.incident_id,
                    score,
                });
            }
        }
        best
    }

    /// Adds a member to an incident. Returns false if the id is unknown.
    pub fn absorb(
        &mut self,
        incident_id: i64,
        embedding: &[f32],
        keywords: &HashSet<String>,
        received_at: NaiveDateTime,
    ) -> bool {
        match self
            .signatures
            .binary_search_by_key(&incident_id, |s| s.incident_id)
        {
            Ok(idx) => {
                self.signatures[idx].absorb(embedding, keywords, received_at);
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 7, day)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn kw(words: &[&str]) -> HashSet<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn signature(id: i64, centroid: Vec<f32>, words: &[&str]) -> IncidentSignature {
        IncidentSignature {
            incident_id: id,
            centroid,
            keyword_signature: kw(words),
            member_count: 1,
            closed_at: Some(at(1)),
        }
    }

    #[test]
    fn test_from_members_mean_and_union() {
        let sig = IncidentSignature::from_members(
            7,
            &[vec![1.0, 0.0], vec![0.0, 1.0]],
            &[kw(&["가로등"]), kw(&["고장", "가로등"])],
            None,
            2,
        )
        .unwrap();
        assert_eq!(sig.centroid, vec![0.5, 0.5]);
        assert_eq!(sig.keyword_signature, kw(&["가로등", "고장"]));
        assert_eq!(sig.member_count, 2);
        assert!(IncidentSignature::from_members(1, &[], &[], None, 2).is_none());
    }

    #[test]
    fn test_running_mean_matches_recomputation() {
        let members = vec![vec![1.0, 2.0], vec![3.0, 0.0], vec![2.0, 4.0]];
        let keywords = vec![kw(&["a"]), kw(&["b"]), kw(&["c"])];
        let full = IncidentSignature::from_members(1, &members, &keywords, None, 2).unwrap();

        let mut running = IncidentSignature::from_members(1, &members[..1], &keywords[..1], None, 2).unwrap();
        running.absorb(&members[1], &keywords[1], at(2));
        running.absorb(&members[2], &keywords[2], at(1));
        for (a, b) in running.centroid.iter().zip(full.centroid.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(running.keyword_signature, full.keyword_signature);
        assert_eq!(running.member_count, 3);
        // closedAt never moves backwards.
        assert_eq!(running.closed_at, Some(at(2)));
    }

    #[test]
    fn test_best_match_ties_go_to_lowest_id() {
        let index = IncidentIndex::new(vec![
            signature(30, vec![1.0, 0.0], &["소음"]),
            signature(12, vec![1.0, 0.0], &["소음"]),
            signature(20, vec![0.0, 1.0], &["소음"]),
        ]);
        let best = index.best_match(&[1.0, 0.0], &kw(&["소음"]), 0.5).unwrap();
        assert_eq!(best.incident_id, 12);
        assert!((best.score - 1.0).abs() < 1e-9);
        assert!(IncidentIndex::default().best_match(&[1.0], &kw(&[]), 0.5).is_none());
    }

    #[test]
    fn test_index_absorb_unknown_id() {
        let mut index = IncidentIndex::new(vec![signature(3, vec![1.0, 0.0], &[])]);
        assert!(!index.absorb(4, &[0.0, 1.0], &kw(&[]), at(3)));
        assert!(index.absorb(3, &[0.0, 1.0], &kw(&["x"]), at(3)));
        let sig = index.get(3).unwrap();
        assert_eq!(sig.member_count, 2);
        assert_eq!(sig.centroid, vec![0.5, 0.5]);
        assert_eq!(sig.closed_at, Some(at(3)));
    }
}
