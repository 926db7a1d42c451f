// src/clustering/title.rs

//! Human-readable, corpus-unique titles for newly formed incidents.
//!
//! The set of titles already in use is threaded through explicitly: callers
//! hand it in and get the grown set back, so several partitions can synthesize
//! titles independently and merge afterwards.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use crate::clustering::hybrid_distance::coerce_embeddings;
use crate::models::complaint::ComplaintRecord;
use crate::utils::candle::cosine_similarity;
use crate::utils::keywords::{clean_keywords, ranked_keywords};

/// Title used when neither the medoid text nor any keyword is usable.
pub const PLACEHOLDER_TITLE: &str = "복합 민원";
/// Suffix appended to keyword-derived titles ("... related").
pub const RELATION_SUFFIX: &str = "관련";

static DISALLOWED_CHARS: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"[^\p{L}\p{N}\s]").ok());

/// Replaces anything but letters, digits and whitespace with a space, then
/// collapses runs of whitespace.
pub fn clean_title(raw: &str) -> String {
    let replaced = match DISALLOWED_CHARS.as_ref() {
        Some(re) => re.replace_all(raw, " ").into_owned(),
        None => raw
            .chars()
            .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
            .collect(),
    };
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect::<String>().trim_end().to_string()
}

/// Appends `suffix` to `base`, shortening the base so the result stays within `max_len`.
fn with_suffix(base: &str, suffix: &str, max_len: usize) -> String {
    let room = max_len.saturating_sub(suffix.chars().count());
    format!("{}{}", truncate_chars(base, room), suffix)
}

/// Index of the member closest to the mean embedding; ties go to the lower index.
pub fn medoid_index(embeddings: &[Vec<f32>]) -> Option<usize> {
    if embeddings.is_empty() {
        return None;
    }
    let vectors = coerce_embeddings(embeddings, 0);
    let dim = vectors[0].len();
    let mut centroid = vec![0.0f32; dim];
    for v in &vectors {
        for (c, x) in centroid.iter_mut().zip(v.iter()) {
            *c += *x;
        }
    }
    let n = vectors.len() as f32;
    centroid.iter_mut().for_each(|c| *c /= n);

    let mut best = 0usize;
    let mut best_dist = f64::INFINITY;
    for (idx, v) in vectors.iter().enumerate() {
        let d = 1.0 - cosine_similarity(v, &centroid);
        if d < best_dist {
            best = idx;
            best_dist = d;
        }
    }
    Some(best)
}

/// Base title before collision handling: the medoid's own text when it is a
/// sensible length, otherwise the top keywords.
fn base_title(members: &[&ComplaintRecord], ranked: &[String]) -> String {
    let embeddings: Vec<Vec<f32>> = members.iter().map(|m| m.embedding.clone()).collect();
    if let Some(idx) = medoid_index(&embeddings) {
        let text = &members[idx].text;
        let len = text.chars().count();
        if len > 3 && len < 50 {
            let cleaned = clean_title(&text.replace(['\n', '\r'], " "));
            if !cleaned.is_empty() {
                return cleaned;
            }
        }
    }
    match ranked {
        [first, second, ..] => format!("{}, {} {}", first, second, RELATION_SUFFIX),
        [only] => format!("{} {}", only, RELATION_SUFFIX),
        [] => PLACEHOLDER_TITLE.to_string(),
    }
}

/// Builds a title for `members` that is not in `titles_in_use`.
///
/// Collisions are resolved in a fixed order: the next most frequent keyword
/// not already in the base title, in parentheses; then the earliest member's
/// `MM/DD`; then ` #1`, ` #2`, ... until free. The numeric stage always
/// terminates because the in-use set is finite.
///
/// Arguments:
/// * `members` - Cluster members, ordered by ascending complaint id.
/// * `max_len` - Maximum title length in characters.
/// * `titles_in_use` - Titles currently held by other incidents.
///
/// Returns:
/// The new title and the in-use set with that title added.
pub fn synthesize_title(
    members: &[&ComplaintRecord],
    max_len: usize,
    mut titles_in_use: HashSet<String>,
) -> (String, HashSet<String>) {
    let max_len = max_len.max(1);
    let cleaned_sets: Vec<HashSet<String>> = members.iter().map(|m| clean_keywords(&m.keywords)).collect();
    let ranked: Vec<String> = ranked_keywords(&cleaned_sets).into_iter().map(|(k, _)| k).collect();

    let base = truncate_chars(&base_title(members, &ranked), max_len);
    let base = if base.is_empty() { PLACEHOLDER_TITLE.to_string() } else { base };

    let mut candidates = std::iter::once(base.clone())
        .chain(
            ranked
                .iter()
                .filter(|kw| !base.contains(kw.as_str()))
                .map(|kw| with_suffix(&base, &format!(" ({})", kw), max_len)),
        )
        .chain(
            members
                .iter()
                .map(|m| m.received_at)
                .min()
                .map(|earliest| with_suffix(&base, &format!(" ({})", earliest.format("%m/%d")), max_len)),
        );

    let title = match candidates.find(|t| !titles_in_use.contains(t)) {
        Some(t) => t,
        None => (1usize..)
            .map(|n| with_suffix(&base, &format!(" #{}", n), max_len))
            .find(|t| !titles_in_use.contains(t))
            .unwrap_or_else(|| base.clone()),
    };

    titles_in_use.insert(title.clone());
    (title, titles_in_use)
}
