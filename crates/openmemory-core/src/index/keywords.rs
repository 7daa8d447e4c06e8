//! Keyword extraction
//!
//! Tokens are lowercased alphanumeric runs, stop-word filtered, and kept
//! only at or above the configured minimum length. The same token stream
//! feeds the SimHash fingerprint so the two signals agree on what a word is.

use std::collections::BTreeSet;

/// Common English stop words dropped by the token filter
const STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "because",
    "been", "but", "by", "can", "could", "did", "do", "does", "for", "from", "had", "has", "have",
    "he", "her", "his", "how", "i", "if", "in", "into", "is", "it", "its", "just", "like", "me",
    "more", "most", "my", "no", "not", "of", "on", "one", "only", "or", "other", "our", "out",
    "over", "she", "should", "so", "some", "than", "that", "the", "their", "them", "then", "there",
    "these", "they", "this", "to", "up", "us", "was", "we", "were", "what", "when", "where",
    "which", "who", "will", "with", "would", "you", "your",
];

fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.binary_search(&token).is_ok()
}

/// Split text into filtered tokens, preserving order and duplicates
pub fn tokenize(text: &str, min_length: usize) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= min_length && !is_stop_word(t))
        .map(|t| t.to_string())
        .collect()
}

/// Extract the keyword set of a text (sorted, deduplicated)
pub fn keywords(text: &str, min_length: usize) -> BTreeSet<String> {
    tokenize(text, min_length).into_iter().collect()
}

/// Jaccard similarity of two keyword sets
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f32 / union as f32
}

/// Fraction of query keywords a memory covers, the fusion `kw` term
pub fn keyword_overlap(query: &BTreeSet<String>, memory: &BTreeSet<String>) -> f32 {
    if query.is_empty() {
        return 0.0;
    }
    query.intersection(memory).count() as f32 / query.len() as f32
}

// ============================================================================
// TESTS
// ============================================================================
