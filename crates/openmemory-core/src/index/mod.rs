//! Lexical signals
//!
//! Deterministic 64-bit SimHash fingerprints for near-duplicate detection
//! and stop-word-filtered keyword sets backing the inverted index and the
//! keyword-overlap term of score fusion.

mod keywords;
mod simhash;

pub use keywords::{jaccard, keyword_overlap, keywords, tokenize};
pub use simhash::{hamming_distance, simhash};
