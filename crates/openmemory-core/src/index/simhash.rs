//! 64-bit SimHash fingerprints
//!
//! Signed accumulation over token unigram and bigram hashes, sign-quantized
//! into bits. Near-duplicate texts land within a small Hamming distance;
//! the engine treats distance <= 3 as the default duplicate threshold.

use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

use super::keywords::tokenize;

/// Seed separating bigram hashes from unigram hashes
const BIGRAM_SEED: u64 = 0xB16_4A3;

/// Compute the 64-bit SimHash of a text
///
/// Returns 0 for texts with no surviving tokens; callers treat 0 as
/// "fingerprint missing" and fall back to keyword overlap.
pub fn simhash(text: &str, min_token_length: usize) -> u64 {
    let tokens = tokenize(text, min_token_length);
    if tokens.is_empty() {
        return 0;
    }

    let mut lanes = [0_i32; 64];

    let mut accumulate = |hash: u64| {
        for (bit, lane) in lanes.iter_mut().enumerate() {
            if (hash >> bit) & 1 == 1 {
                *lane += 1;
            } else {
                *lane -= 1;
            }
        }
    };

    for token in &tokens {
        accumulate(xxh3_64(token.as_bytes()));
    }
    for pair in tokens.windows(2) {
        let joined = format!("{} {}", pair[0], pair[1]);
        accumulate(xxh3_64_with_seed(joined.as_bytes(), BIGRAM_SEED));
    }

    let mut hash = 0_u64;
    for (bit, lane) in lanes.iter().enumerate() {
        if *lane > 0 {
            hash |= 1 << bit;
        }
    }
    hash
}

/// Hamming distance between two fingerprints
#[inline]
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let a = simhash("The quick brown fox jumps over the lazy dog", 3);
        let b = simhash("The quick brown fox jumps over the lazy dog", 3);
        assert_eq!(a, b);
        assert_ne!(a, 0);
    }

    #[test]
    fn test_empty_text_yields_zero() {
        assert_eq!(simhash("", 3), 0);
        assert_eq!(simhash("a an the", 3), 0);
    }

    #[test]
    fn test_near_duplicates_are_close() {
        let base = simhash("meeting with alice at three about quarterly planning goals", 3);
        let near = simhash("meeting with alice at three about quarterly planning targets", 3);
        let far = simhash("recipe for sourdough bread with rye flour and honey", 3);

        assert!(hamming_distance(base, near) < hamming_distance(base, far));
    }

    #[test]
    fn test_identical_texts_zero_distance() {
        let a = simhash("same text here", 3);
        assert_eq!(hamming_distance(a, a), 0);
    }

    #[test]
    fn test_hamming_distance() {
        assert_eq!(hamming_distance(0b1010, 0b0101), 4);
        assert_eq!(hamming_distance(u64::MAX, 0), 64);
    }
}
