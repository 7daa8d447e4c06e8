//! Synthetic deterministic embedder
//!
//! Hash-based feature embedding: token and character-trigram features are
//! xxh3-hashed into a signed accumulator and L2-normalized. No model, no
//! network, stable across runs and platforms. Texts sharing features land
//! near each other, which is all the fallback needs.

use xxhash_rust::xxh3::xxh3_64_with_seed;

use super::{l2_normalize, EmbedError, Embedder};
use crate::memory::{Sector, SectorMap};

/// Base seed for simple-mode embedding
const BASE_SEED: u64 = 0x6F70656E_6D656D;

/// Signed contributions scattered per feature
const SCATTER: usize = 8;

/// Deterministic hash-based embedder
///
/// In per-sector mode each sector salts the feature hashes, producing five
/// distinct (but equally deterministic) views of the same text.
#[derive(Debug, Clone)]
pub struct SyntheticEmbedder {
    dimensions: usize,
    per_sector: bool,
}

impl SyntheticEmbedder {
    /// Simple-mode embedder: one vector reused for every sector
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            per_sector: false,
        }
    }

    /// Advanced-mode embedder: sector-salted vectors
    pub fn per_sector(dimensions: usize) -> Self {
        Self {
            dimensions,
            per_sector: true,
        }
    }

    fn embed_with_seed(&self, text: &str, seed: u64) -> Result<Vec<f32>, EmbedError> {
        let normalized = text.to_lowercase();
        let mut acc = vec![0.0_f32; self.dimensions];
        let mut features = 0_usize;

        // Token features
        for token in normalized.split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            self.scatter(token.as_bytes(), seed, &mut acc);
            features += 1;
        }

        // Character trigram features give partial-word overlap some signal
        let chars: Vec<char> = normalized.chars().filter(|c| c.is_alphanumeric()).collect();
        for window in chars.windows(3) {
            let trigram: String = window.iter().collect();
            self.scatter(trigram.as_bytes(), seed ^ 0xA5A5, &mut acc);
            features += 1;
        }

        if features == 0 {
            return Err(EmbedError::InvalidInput(
                "no embeddable features in text".to_string(),
            ));
        }

        l2_normalize(&mut acc);
        Ok(acc)
    }

    /// Spread one feature hash over SCATTER signed lanes
    fn scatter(&self, feature: &[u8], seed: u64, acc: &mut [f32]) {
        let mut h = xxh3_64_with_seed(feature, seed);
        for _ in 0..SCATTER {
            // xorshift step; each round yields one (lane, sign) pair
            h ^= h << 13;
            h ^= h >> 7;
            h ^= h << 17;
            let lane = (h % self.dimensions as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            acc[lane] += sign;
        }
    }
}

impl Embedder for SyntheticEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "synthetic"
    }

    fn is_per_sector(&self) -> bool {
        self.per_sector
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.embed_with_seed(text, BASE_SEED)
    }

    fn embed_per_sector(&self, text: &str) -> Result<SectorMap<Vec<f32>>, EmbedError> {
        if !self.per_sector {
            let v = self.embed(text)?;
            return Ok(SectorMap::from_fn(|_| v.clone()));
        }

        let mut out: SectorMap<Vec<f32>> = SectorMap::default();
        for sector in Sector::ALL {
            let salt = xxh3_64_with_seed(sector.as_str().as_bytes(), BASE_SEED);
            out[sector] = self.embed_with_seed(text, salt)?;
        }
        Ok(out)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::{cosine_similarity, is_normalized};

    #[test]
    fn test_deterministic() {
        let embedder = SyntheticEmbedder::new(128);
        let a = embedder.embed("the quick brown fox").unwrap();
        let b = embedder.embed("the quick brown fox").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_output_is_normalized() {
        let embedder = SyntheticEmbedder::new(64);
        let v = embedder.embed("hello world").unwrap();
        assert_eq!(v.len(), 64);
        assert!(is_normalized(&v));
    }

    #[test]
    fn test_shared_tokens_raise_similarity() {
        let embedder = SyntheticEmbedder::new(256);
        let a = embedder.embed("meeting with alice about the roadmap").unwrap();
        let b = embedder.embed("meeting with alice about the budget").unwrap();
        let c = embedder.embed("zebra photosynthesis harmonica").unwrap();

        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[test]
    fn test_empty_text_rejected() {
        let embedder = SyntheticEmbedder::new(64);
        assert!(embedder.embed("   ").is_err());
    }

    #[test]
    fn test_simple_mode_reuses_one_vector() {
        let embedder = SyntheticEmbedder::new(64);
        let map = embedder.embed_per_sector("some text").unwrap();
        assert_eq!(map[Sector::Episodic], map[Sector::Reflective]);
    }

    #[test]
    fn test_per_sector_mode_differs_by_sector() {
        let embedder = SyntheticEmbedder::per_sector(64);
        assert!(embedder.is_per_sector());
        let map = embedder.embed_per_sector("some text").unwrap();
        assert_ne!(map[Sector::Episodic], map[Sector::Semantic]);
        for sector in Sector::ALL {
            assert!(is_normalized(&map[sector]));
        }
    }
}
