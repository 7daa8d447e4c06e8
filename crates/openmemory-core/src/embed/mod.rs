//! Embedder capability
//!
//! The engine never talks to embedding providers directly; it consumes this
//! trait. Providers (OpenAI, Ollama, local ONNX, ...) live outside the core.
//! A deterministic synthetic embedder ships in-crate as the cold-start and
//! failure fallback so writes never block on a provider.
//!
//! All vectors handed to the engine are L2-normalized.

mod synthetic;

pub use synthetic::SyntheticEmbedder;

use crate::memory::SectorMap;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Embedding error types
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum EmbedError {
    /// The provider failed
    Provider(String),
    /// The provider deadline elapsed
    Timeout,
    /// Invalid input (empty, wrong dimensions, ...)
    InvalidInput(String),
}

impl std::fmt::Display for EmbedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbedError::Provider(e) => write!(f, "Provider failed: {}", e),
            EmbedError::Timeout => write!(f, "Embedding timed out"),
            EmbedError::InvalidInput(e) => write!(f, "Invalid input: {}", e),
        }
    }
}

impl std::error::Error for EmbedError {}

// ============================================================================
// EMBEDDER TRAIT
// ============================================================================

/// Text-to-vector capability
///
/// Contract: deterministic for a given (text, provider, sector); outputs are
/// L2-normalized and `dimensions()` wide. Providers enforce their own
/// deadline and surface `EmbedError::Timeout` when it elapses.
pub trait Embedder: Send + Sync {
    /// Vector width
    fn dimensions(&self) -> usize;

    /// Provider name, recorded in telemetry only
    fn name(&self) -> &str;

    /// Whether `embed_per_sector` yields sector-specific vectors
    /// (advanced mode) or one shared vector (simple mode)
    fn is_per_sector(&self) -> bool {
        false
    }

    /// Embed text into a single vector
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// Embed text once per sector. Simple-mode providers reuse one vector.
    fn embed_per_sector(&self, text: &str) -> Result<SectorMap<Vec<f32>>, EmbedError> {
        let v = self.embed(text)?;
        Ok(SectorMap::from_fn(|_| v.clone()))
    }
}

// ============================================================================
// VECTOR MATH
// ============================================================================

/// Compute cosine similarity between two vectors
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = (norm_a * norm_b).sqrt();
    if denominator > 0.0 {
        dot / denominator
    } else {
        0.0
    }
}

/// Scale a vector to unit length in place; zero vectors stay zero
#[inline]
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Whether a vector is unit length within tolerance
#[inline]
pub fn is_normalized(vector: &[f32]) -> bool {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    (norm - 1.0).abs() < 1e-3
}

/// Element-wise mean of a non-empty set of equal-length vectors
pub fn mean_vector(vectors: &[&[f32]]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let mut acc = vec![0.0_f32; first.len()];
    for v in vectors {
        if v.len() != acc.len() {
            return None;
        }
        for (a, x) in acc.iter_mut().zip(v.iter()) {
            *a += x;
        }
    }
    let n = vectors.len() as f32;
    for a in acc.iter_mut() {
        *a /= n;
    }
    Some(acc)
}

/// Serialize a vector as little-endian f32 bytes for BLOB storage
pub fn vec_to_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Deserialize a little-endian f32 BLOB
pub fn vec_from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-4);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!(is_normalized(&v));
        assert!((v[0] - 0.6).abs() < 1e-4);
        assert!((v[1] - 0.8).abs() < 1e-4);
    }

    #[test]
    fn test_normalize_zero_vector_stays_zero() {
        let mut v = vec![0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0]);
        assert!(!is_normalized(&v));
    }

    #[test]
    fn test_mean_vector() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        let mean = mean_vector(&[&a, &b]).unwrap();
        assert_eq!(mean, vec![0.5, 0.5]);

        assert!(mean_vector(&[]).is_none());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let v = vec![1.5, -2.5, 0.25];
        let restored = vec_from_bytes(&vec_to_bytes(&v)).unwrap();
        assert_eq!(v, restored);

        assert!(vec_from_bytes(&[0, 1, 2]).is_none());
    }
}
