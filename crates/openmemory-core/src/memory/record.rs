//! Memory records and facade input/output types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::metadata::Metadata;
use super::sector::Sector;

// ============================================================================
// MEMORY
// ============================================================================

/// A stored memory
///
/// The row owned by the metadata store; vectors live in the per-sector
/// indexes and the `vectors` table, keyed by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    /// Unique identifier (UUID v7, time-ordered)
    pub id: String,
    /// Owning user, if any
    pub user_id: Option<String>,
    /// The memory text
    pub content: String,
    /// Sector the memory primarily belongs to
    pub primary_sector: Sector,
    /// Normalized tags
    pub tags: Vec<String>,
    /// Schema-checked metadata
    pub metadata: Metadata,
    /// 64-bit locality-sensitive fingerprint of the content
    pub simhash: u64,
    /// Importance scalar in [0, 1]
    pub salience: f32,
    /// Per-memory exponential decay rate (per hour)
    pub decay_lambda: f32,
    /// When the memory was created
    pub created_at: DateTime<Utc>,
    /// When the memory was last mutated
    pub updated_at: DateTime<Utc>,
    /// When the memory was last retrieved or refreshed
    pub last_seen_at: DateTime<Utc>,
    /// When a decay sweep last touched this memory
    pub decayed_at: Option<DateTime<Utc>>,
    /// Monotonic version, bumped on every mutation
    pub version: u32,
    /// Soft-delete marker; purged at the sweep after it is set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tombstoned_at: Option<DateTime<Utc>>,
}

impl Memory {
    /// The instant decay integrates from: the latest of creation, last
    /// access, and the previous sweep.
    pub fn decay_anchor(&self) -> DateTime<Utc> {
        let mut anchor = self.created_at.max(self.last_seen_at);
        if let Some(decayed) = self.decayed_at {
            anchor = anchor.max(decayed);
        }
        anchor
    }

    /// Hours since the memory was last seen, never negative
    pub fn age_hours(&self, now: DateTime<Utc>) -> f32 {
        let secs = (now - self.last_seen_at).num_seconds().max(0);
        secs as f32 / 3600.0
    }

    /// Whether the memory has been soft-deleted
    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned_at.is_some()
    }
}

// ============================================================================
// WRITE PATH
// ============================================================================

/// Input for creating a new memory
///
/// Uses `deny_unknown_fields` to prevent field injection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AddInput {
    /// The content to remember
    pub content: String,
    /// Tags for categorization
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form metadata attached by the caller
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Owning user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl AddInput {
    /// Create an input with content only
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tags: vec![],
            metadata: serde_json::Map::new(),
            user_id: None,
        }
    }
}

/// Result of `add`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOutcome {
    /// The memory id (existing id when deduplicated)
    pub id: String,
    /// Elected primary sector
    pub primary_sector: Sector,
    /// All sectors the memory was filed under, primary first
    pub sectors: Vec<Sector>,
    /// Number of content chunks stored (always 1; chunking belongs to the
    /// extraction layer upstream of the engine)
    pub chunks: usize,
    /// True when a near-duplicate inside the dedup window absorbed the write
    pub deduplicated: bool,
}

// ============================================================================
// QUERY PATH
// ============================================================================

/// Optional filters applied after scoring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryFilters {
    /// Restrict routing to exactly these sectors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sectors: Option<Vec<Sector>>,
    /// Drop candidates below this salience
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_salience: Option<f32>,
    /// Only memories owned by this user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Candidates must carry every listed tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

/// A ranked query result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMatch {
    /// Memory id
    pub id: String,
    /// Memory content
    pub content: String,
    /// Primary sector of the memory
    pub primary_sector: Sector,
    /// Sectors whose scans surfaced this memory
    pub sectors: Vec<Sector>,
    /// Salience at scoring time (before the post-response bump)
    pub salience: f32,
    /// Fused score the ranking used
    pub score: f32,
    /// Sectors the query was routed through
    pub path: Vec<Sector>,
    /// Last-seen timestamp at scoring time
    pub last_seen_at: DateTime<Utc>,
}

/// Filters for `list`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListFilter {
    /// Only memories owned by this user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Only memories whose primary sector matches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector: Option<Sector>,
    /// Memories must carry every listed tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Drop memories below this salience
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_salience: Option<f32>,
}

// ============================================================================
// MAINTENANCE REPORTS
// ============================================================================

/// Result of a decay sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecayReport {
    /// Memories examined
    pub processed: u64,
    /// Memories whose salience changed
    pub decayed: u64,
    /// Memories soft-deleted this sweep
    pub tombstoned: u64,
    /// Tombstones from earlier sweeps removed for good
    pub purged: u64,
}

/// Result of a reflection run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectionReport {
    /// Reflection memories created
    pub created: u64,
    /// Clusters examined (size >= 2, not yet consolidated)
    pub clusters: u64,
}

/// Result of explicit reinforcement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReinforceOutcome {
    /// Memory id
    pub id: String,
    /// Salience after the boost
    pub salience: f32,
}

/// Result of associative propagation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagationOutcome {
    /// Memories whose salience the walk updated, in visit order
    pub updated_ids: Vec<String>,
}

/// Result of a waypoint/edge pruning pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    /// Waypoints deleted
    pub waypoints_pruned: u64,
    /// Orphan vectors reassigned or reseeded
    pub vectors_reassigned: u64,
    /// Edges dropped (decayed below threshold or dangling)
    pub edges_pruned: u64,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn base_memory(now: DateTime<Utc>) -> Memory {
        Memory {
            id: "m-1".into(),
            user_id: None,
            content: "test".into(),
            primary_sector: Sector::Semantic,
            tags: vec![],
            metadata: Metadata::default(),
            simhash: 0,
            salience: 0.5,
            decay_lambda: 0.01,
            created_at: now,
            updated_at: now,
            last_seen_at: now,
            decayed_at: None,
            version: 1,
            tombstoned_at: None,
        }
    }

    #[test]
    fn test_decay_anchor_prefers_latest() {
        let now = Utc::now();
        let mut m = base_memory(now - chrono::Duration::hours(10));

        assert_eq!(m.decay_anchor(), m.created_at);

        m.last_seen_at = now - chrono::Duration::hours(5);
        assert_eq!(m.decay_anchor(), m.last_seen_at);

        m.decayed_at = Some(now - chrono::Duration::hours(1));
        assert_eq!(m.decay_anchor(), m.decayed_at.unwrap());
    }

    #[test]
    fn test_age_hours_never_negative() {
        let now = Utc::now();
        let mut m = base_memory(now);
        m.last_seen_at = now + chrono::Duration::hours(1);
        assert_eq!(m.age_hours(now), 0.0);

        m.last_seen_at = now - chrono::Duration::hours(2);
        assert!((m.age_hours(now) - 2.0).abs() < 0.01);
    }

    #[test]
    fn test_add_input_deny_unknown_fields() {
        let json = r#"{"content": "test", "tags": ["a"]}"#;
        assert!(serde_json::from_str::<AddInput>(json).is_ok());

        let json_with_unknown = r#"{"content": "test", "sneaky": true}"#;
        assert!(serde_json::from_str::<AddInput>(json_with_unknown).is_err());
    }
}
