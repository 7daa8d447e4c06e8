//! Cognitive sectors
//!
//! Memories are filed under one of five fixed sectors. The set is closed:
//! per-sector configuration and the cross-sector resonance table are arrays
//! keyed by the variant tag, so sector lookups never hash.

use serde::{Deserialize, Serialize};

// ============================================================================
// SECTOR
// ============================================================================

/// One of the five fixed cognitive sectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sector {
    /// What happened - events, conversations, specific moments
    Episodic,
    /// What is known - facts, concepts, generalizations
    #[default]
    Semantic,
    /// How to do things - skills, procedures
    Procedural,
    /// How it felt - affect-laden moments
    Emotional,
    /// What was learned from other memories - synthesized summaries
    Reflective,
}

/// Number of sectors (fixed)
pub const SECTOR_COUNT: usize = 5;

impl Sector {
    /// All sectors in canonical order
    pub const ALL: [Sector; SECTOR_COUNT] = [
        Sector::Episodic,
        Sector::Semantic,
        Sector::Procedural,
        Sector::Emotional,
        Sector::Reflective,
    ];

    /// Canonical index into sector-keyed arrays
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Sector::Episodic => 0,
            Sector::Semantic => 1,
            Sector::Procedural => 2,
            Sector::Emotional => 3,
            Sector::Reflective => 4,
        }
    }

    /// Convert to string representation
    pub fn as_str(self) -> &'static str {
        match self {
            Sector::Episodic => "episodic",
            Sector::Semantic => "semantic",
            Sector::Procedural => "procedural",
            Sector::Emotional => "emotional",
            Sector::Reflective => "reflective",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "episodic" => Some(Sector::Episodic),
            "semantic" => Some(Sector::Semantic),
            "procedural" => Some(Sector::Procedural),
            "emotional" => Some(Sector::Emotional),
            "reflective" => Some(Sector::Reflective),
            _ => None,
        }
    }

    /// Descriptor text embedded once at engine build to form the sector's
    /// identity vector (primary-sector election, multi-sector membership).
    pub fn identity_descriptor(self) -> &'static str {
        match self {
            Sector::Episodic => {
                "what happened: an event, conversation or experience at a specific time and place"
            }
            Sector::Semantic => "a fact, concept, definition or general piece of knowledge",
            Sector::Procedural => "how to do something: a step by step procedure, method or skill",
            Sector::Emotional => "a feeling, mood, reaction or emotionally charged moment",
            Sector::Reflective => "a pattern, insight or summary distilled from earlier memories",
        }
    }
}

impl std::fmt::Display for Sector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Sector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Sector::parse_name(s).ok_or_else(|| format!("Unknown sector: {}", s))
    }
}

// ============================================================================
// SECTOR MAP
// ============================================================================

/// A value per sector, stored densely and indexed by variant tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorMap<T>([T; SECTOR_COUNT]);

impl<T> SectorMap<T> {
    /// Build a map by evaluating `f` once per sector, in canonical order
    pub fn from_fn(mut f: impl FnMut(Sector) -> T) -> Self {
        Self(Sector::ALL.map(&mut f))
    }

    /// Iterate `(sector, value)` pairs in canonical order
    pub fn iter(&self) -> impl Iterator<Item = (Sector, &T)> {
        Sector::ALL.iter().copied().zip(self.0.iter())
    }

    /// Mutable iteration in canonical order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Sector, &mut T)> {
        Sector::ALL.iter().copied().zip(self.0.iter_mut())
    }
}

impl<T: Default> Default for SectorMap<T> {
    fn default() -> Self {
        Self::from_fn(|_| T::default())
    }
}

impl<T> std::ops::Index<Sector> for SectorMap<T> {
    type Output = T;

    #[inline]
    fn index(&self, sector: Sector) -> &T {
        &self.0[sector.index()]
    }
}

impl<T> std::ops::IndexMut<Sector> for SectorMap<T> {
    #[inline]
    fn index_mut(&mut self, sector: Sector) -> &mut T {
        &mut self.0[sector.index()]
    }
}

// ============================================================================
// RESONANCE
// ============================================================================

/// Static cross-sector resonance table, symmetric, indexed `[from][to]`.
///
/// High resonance means a candidate surfaced while scanning one sector is
/// still a plausible answer when it primarily belongs to the other.
const RESONANCE: [[f32; SECTOR_COUNT]; SECTOR_COUNT] = [
    // episodic  semantic  procedural  emotional  reflective
    [1.0, 0.4, 0.5, 0.7, 0.3], // episodic
    [0.4, 1.0, 0.4, 0.2, 0.8], // semantic
    [0.5, 0.4, 1.0, 0.2, 0.3], // procedural
    [0.7, 0.2, 0.2, 1.0, 0.4], // emotional
    [0.3, 0.8, 0.3, 0.4, 1.0], // reflective
];

/// Resonance between the sector a candidate was found in and its primary sector
#[inline]
pub fn resonance(scanned: Sector, primary: Sector) -> f32 {
    RESONANCE[scanned.index()][primary.index()]
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_roundtrip() {
        for sector in Sector::ALL {
            assert_eq!(Sector::parse_name(sector.as_str()), Some(sector));
        }
        assert_eq!(Sector::parse_name("nonsense"), None);
    }

    #[test]
    fn test_sector_indices_are_canonical() {
        for (i, sector) in Sector::ALL.iter().enumerate() {
            assert_eq!(sector.index(), i);
        }
    }

    #[test]
    fn test_sector_map_indexing() {
        let mut map = SectorMap::from_fn(|s| s.index() as u32);
        assert_eq!(map[Sector::Episodic], 0);
        assert_eq!(map[Sector::Reflective], 4);

        map[Sector::Semantic] = 42;
        assert_eq!(map[Sector::Semantic], 42);
    }

    #[test]
    fn test_resonance_symmetric_with_unit_diagonal() {
        for a in Sector::ALL {
            assert!((resonance(a, a) - 1.0).abs() < f32::EPSILON);
            for b in Sector::ALL {
                assert!((resonance(a, b) - resonance(b, a)).abs() < f32::EPSILON);
                assert!((0.0..=1.0).contains(&resonance(a, b)));
            }
        }
    }

    #[test]
    fn test_resonance_pairs() {
        // Semantic and reflective reinforce each other strongly
        assert!(resonance(Sector::Semantic, Sector::Reflective) > 0.7);
        // Episodic and procedural moderately
        assert!((resonance(Sector::Episodic, Sector::Procedural) - 0.5).abs() < f32::EPSILON);
    }
}
