//! Engine configuration
//!
//! One immutable `EngineConfig` snapshot is shared behind an `Arc`; the
//! facade's `update_config` swaps the whole snapshot so readers never
//! observe a half-applied change.

use serde::{Deserialize, Serialize};

use crate::memory::{Sector, SectorMap};

// ============================================================================
// PER-SECTOR CONFIG
// ============================================================================

/// Tuning for one sector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectorConfig {
    /// Bias added to the routing score for this sector
    pub routing_weight: f32,
    /// Half-life for salience decay, hours
    pub decay_half_life_hours: f32,
    /// Salience never decays below this floor
    pub min_salience_floor: f32,
}

impl SectorConfig {
    /// Exponential decay rate per hour derived from the half-life
    pub fn decay_lambda(&self) -> f32 {
        std::f32::consts::LN_2 / self.decay_half_life_hours.max(f32::EPSILON)
    }
}

fn default_sectors() -> SectorMap<SectorConfig> {
    SectorMap::from_fn(|sector| match sector {
        Sector::Episodic => SectorConfig {
            routing_weight: 1.0,
            decay_half_life_hours: 72.0,
            min_salience_floor: 0.02,
        },
        Sector::Semantic => SectorConfig {
            routing_weight: 1.2,
            decay_half_life_hours: 720.0,
            min_salience_floor: 0.02,
        },
        Sector::Procedural => SectorConfig {
            routing_weight: 0.9,
            decay_half_life_hours: 1440.0,
            min_salience_floor: 0.05,
        },
        Sector::Emotional => SectorConfig {
            routing_weight: 0.8,
            decay_half_life_hours: 168.0,
            min_salience_floor: 0.02,
        },
        Sector::Reflective => SectorConfig {
            routing_weight: 1.1,
            decay_half_life_hours: 2160.0,
            min_salience_floor: 0.1,
        },
    })
}

// ============================================================================
// FUSION / WAYPOINTS
// ============================================================================

/// Weights of the linear score fusion
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionWeights {
    /// Cosine similarity weight
    pub cos: f32,
    /// Salience-times-recency weight
    pub sal: f32,
    /// Keyword overlap weight
    pub kw: f32,
    /// Cross-sector resonance weight
    pub res: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            cos: 0.6,
            sal: 0.2,
            kw: 0.15,
            res: 0.05,
        }
    }
}

/// Waypoint (coarse centroid) layer tuning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaypointConfig {
    /// Sector population below which the index scans exactly
    pub w_min: usize,
    /// Cosine threshold for attaching an insert to an existing centroid
    pub attach_threshold: f32,
    /// Waypoints probed per query
    pub probe: usize,
    /// Exponent applied to waypoint strength when ranking probes
    pub strength_alpha: f32,
    /// Waypoints weaker than this are candidates for pruning
    pub prune_threshold: f32,
    /// Waypoints with at least this many members survive pruning regardless
    pub min_members: usize,
}

impl Default for WaypointConfig {
    fn default() -> Self {
        Self {
            w_min: 200,
            attach_threshold: 0.82,
            probe: 4,
            strength_alpha: 0.5,
            prune_threshold: 0.1,
            min_members: 2,
        }
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

/// Full engine configuration snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Embedding dimensionality; must match the configured embedder
    pub vector_dim: usize,
    /// Per-sector tuning
    pub sectors: SectorMap<SectorConfig>,

    /// Decay sweep cadence
    pub decay_interval_minutes: u64,
    /// Reflection cadence
    pub reflect_interval_minutes: u64,
    /// Waypoint/edge pruning cadence
    pub prune_interval_minutes: u64,
    /// User-summary rebuild cadence
    pub summary_interval_minutes: u64,

    /// Minimum recent memories per user before scheduled reflection runs
    pub reflect_min: usize,
    /// Most recent memories a reflection pass examines
    pub reflect_scan_limit: usize,

    /// Score fusion weights
    pub fusion: FusionWeights,
    /// Waypoint layer tuning
    pub waypoint: WaypointConfig,

    /// Hamming distance at or below which contents are near-duplicates
    pub simhash_hamming_threshold: u32,
    /// Minimum token length kept by the keyword filter
    pub keyword_min_length: usize,
    /// Most-salient memories retained per keyword in the inverted index
    pub keyword_index_cap: usize,
    /// Window in which near-identical writes collapse to one memory
    pub dedup_window_minutes: i64,
    /// Maximum accepted content size
    pub max_content_bytes: usize,
    /// Deadline handed to embedding providers
    pub embedding_timeout_ms: u64,
    /// In-flight embed count above which `add` returns Busy
    pub embed_high_water: usize,

    /// Sectors kept by routing when the caller does not pin them
    pub route_max_sectors: usize,
    /// Per-sector candidate fan-out multiplier
    pub fanout: usize,
    /// Cosine against a sector identity required for extra membership
    pub multi_sector_threshold: f32,
    /// Maximum additional sectors beyond the primary
    pub multi_sector_cap: usize,

    /// Salience assigned at creation
    pub initial_salience: f32,
    /// Implicit salience boost on retrieval hit
    pub retrieval_boost: f32,
    /// Edge weight bump for co-activated result pairs
    pub coactivation_boost: f32,
    /// BFS depth for associative propagation
    pub propagation_depth: usize,
    /// Half-life for edge weight decay, hours
    pub edge_half_life_hours: f32,
    /// Edges weaker than this are pruned
    pub edge_prune_threshold: f32,
    /// Days a floored memory stays unseen before it is tombstoned
    pub grace_days: i64,
    /// Query-embedding LRU capacity
    pub query_cache_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            vector_dim: 256,
            sectors: default_sectors(),
            decay_interval_minutes: 1440,
            reflect_interval_minutes: 10,
            prune_interval_minutes: 7 * 24 * 60,
            summary_interval_minutes: 1440,
            reflect_min: 20,
            reflect_scan_limit: 500,
            fusion: FusionWeights::default(),
            waypoint: WaypointConfig::default(),
            simhash_hamming_threshold: 3,
            keyword_min_length: 3,
            keyword_index_cap: 128,
            dedup_window_minutes: 60,
            max_content_bytes: 64 * 1024,
            embedding_timeout_ms: 30_000,
            embed_high_water: 32,
            route_max_sectors: 3,
            fanout: 4,
            multi_sector_threshold: 0.55,
            multi_sector_cap: 3,
            initial_salience: 0.5,
            retrieval_boost: 0.05,
            coactivation_boost: 0.02,
            propagation_depth: 2,
            edge_half_life_hours: 168.0,
            edge_prune_threshold: 0.05,
            grace_days: 7,
            query_cache_size: 128,
        }
    }
}

impl EngineConfig {
    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.vector_dim == 0 {
            return Err("vector_dim must be positive".into());
        }
        if self.fanout == 0 || self.route_max_sectors == 0 {
            return Err("fanout and route_max_sectors must be positive".into());
        }
        if self.waypoint.probe == 0 {
            return Err("waypoint.probe must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.initial_salience) {
            return Err("initial_salience must be in [0, 1]".into());
        }
        for (sector, sc) in self.sectors.iter() {
            if sc.decay_half_life_hours <= 0.0 {
                return Err(format!("{} decay_half_life_hours must be positive", sector));
            }
            if !(0.0..=1.0).contains(&sc.min_salience_floor) {
                return Err(format!("{} min_salience_floor must be in [0, 1]", sector));
            }
        }
        Ok(())
    }

    /// Apply a partial update, returning the new snapshot
    pub fn with_patch(&self, patch: ConfigPatch) -> Self {
        let mut next = self.clone();
        if let Some(fusion) = patch.fusion {
            next.fusion = fusion;
        }
        if let Some(waypoint) = patch.waypoint {
            next.waypoint = waypoint;
        }
        if let Some(v) = patch.simhash_hamming_threshold {
            next.simhash_hamming_threshold = v;
        }
        if let Some(v) = patch.dedup_window_minutes {
            next.dedup_window_minutes = v;
        }
        if let Some(v) = patch.max_content_bytes {
            next.max_content_bytes = v;
        }
        if let Some(v) = patch.decay_interval_minutes {
            next.decay_interval_minutes = v;
        }
        if let Some(v) = patch.reflect_interval_minutes {
            next.reflect_interval_minutes = v;
        }
        if let Some(v) = patch.reflect_min {
            next.reflect_min = v;
        }
        if let Some(v) = patch.embed_high_water {
            next.embed_high_water = v;
        }
        next
    }
}

/// Partial configuration accepted by `update_config`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigPatch {
    /// Replace the fusion weights
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fusion: Option<FusionWeights>,
    /// Replace the waypoint tuning
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waypoint: Option<WaypointConfig>,
    /// Replace the near-duplicate threshold
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simhash_hamming_threshold: Option<u32>,
    /// Replace the dedup window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_window_minutes: Option<i64>,
    /// Replace the content size limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_content_bytes: Option<usize>,
    /// Replace the decay cadence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decay_interval_minutes: Option<u64>,
    /// Replace the reflection cadence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reflect_interval_minutes: Option<u64>,
    /// Replace the reflection population threshold
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reflect_min: Option<usize>,
    /// Replace the embed backpressure mark
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed_high_water: Option<usize>,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_decay_lambda_matches_half_life() {
        let sc = SectorConfig {
            routing_weight: 1.0,
            decay_half_life_hours: 1.0,
            min_salience_floor: 0.02,
        };
        // After one half-life, exp(-lambda * 1h) == 0.5
        let lambda = sc.decay_lambda();
        assert!(((-lambda).exp() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut cfg = EngineConfig {
            vector_dim: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        cfg.vector_dim = 256;
        cfg.sectors[Sector::Episodic].decay_half_life_hours = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_patch_only_touches_named_fields() {
        let base = EngineConfig::default();
        let patched = base.with_patch(ConfigPatch {
            simhash_hamming_threshold: Some(5),
            ..Default::default()
        });
        assert_eq!(patched.simhash_hamming_threshold, 5);
        assert_eq!(patched.fusion, base.fusion);
        assert_eq!(patched.dedup_window_minutes, base.dedup_window_minutes);
    }
}
