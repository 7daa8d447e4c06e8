//! Schema-checked memory metadata
//!
//! Known keys are typed fields; anything else callers attach rides along in
//! the flattened `extra` map. Stored as a JSON column in the metadata store.

use serde::{Deserialize, Serialize};

/// Per-memory metadata with typed well-known keys and an escape hatch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Metadata {
    /// Set on source memories once a reflection has absorbed them
    #[serde(skip_serializing_if = "is_false")]
    pub consolidated: bool,
    /// Set on memories created by the reflection job itself
    #[serde(skip_serializing_if = "is_false")]
    pub auto_reflect: bool,
    /// Set when the configured embedding provider failed and the synthetic
    /// fallback produced this memory's vectors
    #[serde(skip_serializing_if = "is_false")]
    pub fallback_embedding: bool,
    /// Source memory ids a reflection was synthesized from
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    /// Cluster size behind a reflection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq: Option<u32>,
    /// Derived user summary text (users table mirrors this)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_summary: Option<String>,
    /// Caller-supplied keys the schema does not know about
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl Metadata {
    /// Wrap caller-supplied free-form metadata
    pub fn from_extra(extra: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            extra,
            ..Default::default()
        }
    }

    /// Serialize to the JSON stored in the `memories.meta` column
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse from the stored JSON column; malformed rows degrade to empty
    pub fn from_json(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_serializes_empty() {
        assert_eq!(Metadata::default().to_json(), "{}");
    }

    #[test]
    fn test_known_keys_roundtrip() {
        let meta = Metadata {
            consolidated: true,
            auto_reflect: true,
            sources: vec!["a".into(), "b".into()],
            freq: Some(5),
            ..Default::default()
        };
        let parsed = Metadata::from_json(&meta.to_json());
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_extra_keys_survive() {
        let mut extra = serde_json::Map::new();
        extra.insert("project".into(), serde_json::json!("atlas"));
        let meta = Metadata::from_extra(extra);

        let parsed = Metadata::from_json(&meta.to_json());
        assert_eq!(parsed.extra["project"], serde_json::json!("atlas"));
        assert!(!parsed.consolidated);
    }

    #[test]
    fn test_malformed_json_degrades_to_default() {
        assert_eq!(Metadata::from_json("not json"), Metadata::default());
    }
}
