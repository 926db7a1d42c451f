// src/utils/keywords.rs

use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashSet};

/// Administrative filler that appears in almost every complaint and carries
/// no signal about the underlying issue.
pub static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "항상", "진짜", "너무", "매일", "자꾸", "관리", "민원", "구청", "시장", "사항", "불편",
        "요청", "문의", "신고", "대하여", "관련", "답변", "부탁", "접수", "조치", "확인", "내용",
        "진행", "바랍니다",
    ]
    .into_iter()
    .collect()
});

/// Fallback representative keyword when an incident has no keywords at all.
pub const DEFAULT_REPRESENTATIVE_KEYWORD: &str = "민원";

/// Strips everything but letters, then drops short tokens and stop words.
pub fn clean_keyword(raw: &str) -> Option<String> {
    let cleaned: String = raw.chars().filter(|c| c.is_alphabetic()).collect();
    if cleaned.chars().count() < 2 || STOPWORDS.contains(cleaned.as_str()) {
        return None;
    }
    Some(cleaned)
}

pub fn clean_keywords<'a, I>(raw: I) -> HashSet<String>
where
    I: IntoIterator<Item = &'a String>,
{
    raw.into_iter().filter_map(|k| clean_keyword(k)).collect()
}

/// Keywords ordered by descending frequency, ties broken lexicographically.
pub fn ranked_keywords<'a, I>(keyword_sets: I) -> Vec<(String, usize)>
where
    I: IntoIterator<Item = &'a HashSet<String>>,
{
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for set in keyword_sets {
        for keyword in set {
            *counts.entry(keyword.as_str()).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(k, c)| (k.to_string(), c))
        .collect();
    // BTreeMap yields keys in order, and the sort is stable.
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
}

/// Most frequent raw keyword across the members, or the default keyword.
pub fn representative_keyword<'a, I>(keyword_sets: I) -> String
where
    I: IntoIterator<Item = &'a HashSet<String>>,
{
    ranked_keywords(keyword_sets)
        .into_iter()
        .next()
        .map(|(k, _)| k)
        .unwrap_or_else(|| DEFAULT_REPRESENTATIVE_KEYWORD.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(words: &[&str]) -> HashSet<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_clean_keyword_filters() {
        assert_eq!(clean_keyword("불법주차!!"), Some("불법주차".to_string()));
        assert_eq!(clean_keyword("민원"), None);
        assert_eq!(clean_keyword("a1"), None);
        assert_eq!(clean_keyword("123"), None);
        assert_eq!(clean_keyword("pothole"), Some("pothole".to_string()));
    }

    #[test]
    fn test_clean_keywords_dedupes() {
        let raw = vec!["가로등 ".to_string(), "가로등".to_string(), "요청".to_string()];
        let cleaned = clean_keywords(&raw);
        assert_eq!(cleaned, set(&["가로등"]));
    }

    #[test]
    fn test_ranked_keywords_frequency_then_lexicographic() {
        let sets = vec![set(&["b", "a"]), set(&["b", "c"]), set(&["a"])];
        let ranked = ranked_keywords(&sets);
        assert_eq!(
            ranked,
            vec![("a".to_string(), 2), ("b".to_string(), 2), ("c".to_string(), 1)]
        );
    }

    #[test]
    fn test_representative_keyword_default() {
        let empty: Vec<HashSet<String>> = vec![HashSet::new()];
        assert_eq!(representative_keyword(&empty), DEFAULT_REPRESENTATIVE_KEYWORD);
        let sets = vec![set(&["소음"]), set(&["소음", "공사"])];
        assert_eq!(representative_keyword(&sets), "소음");
    }
}
