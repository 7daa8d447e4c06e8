//! Per-sector vector index
//!
//! Holds `(memory id -> unit vector + salience hint)` for one sector plus
//! the waypoint layer. Below `w_min` members the index scans exactly; above
//! it, queries scan only the probed waypoints' members. With `probe` at or
//! beyond the waypoint count the restricted scan equals the exact scan.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::waypoint::{WaypointLayer, WaypointRow};
use super::VectorStoreError;
use crate::config::WaypointConfig;
use crate::embed::cosine_similarity;

/// One stored vector and the salience hint used for tie-breaking
#[derive(Debug, Clone)]
struct Entry {
    vector: Vec<f32>,
    salience: f32,
}

/// The vector index of a single sector
#[derive(Debug)]
pub struct SectorIndex {
    dimensions: usize,
    entries: HashMap<String, Entry>,
    waypoints: WaypointLayer,
}

impl SectorIndex {
    /// Create an empty index
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            entries: HashMap::new(),
            waypoints: WaypointLayer::default(),
        }
    }

    /// Restore an index from persisted waypoint centroids
    pub fn with_waypoints(dimensions: usize, rows: Vec<WaypointRow>) -> Self {
        Self {
            dimensions,
            entries: HashMap::new(),
            waypoints: WaypointLayer::from_rows(rows),
        }
    }

    /// Number of vectors
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of waypoints
    pub fn waypoint_count(&self) -> usize {
        self.waypoints.len()
    }

    /// Insert or replace a vector
    pub fn upsert(
        &mut self,
        memory_id: &str,
        vector: &[f32],
        salience: f32,
        cfg: &WaypointConfig,
        now: DateTime<Utc>,
    ) -> Result<(), VectorStoreError> {
        if vector.len() != self.dimensions {
            return Err(VectorStoreError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }

        self.entries.insert(
            memory_id.to_string(),
            Entry {
                vector: vector.to_vec(),
                salience,
            },
        );

        if self.layer_active(cfg) {
            if self.waypoints.is_empty() {
                // The population just crossed w_min: bootstrap the layer
                // from everything stored so far.
                let snapshot: Vec<(String, Vec<f32>, f32)> = self
                    .entries
                    .iter()
                    .map(|(id, e)| (id.clone(), e.vector.clone(), e.salience))
                    .collect();
                let mut ordered = snapshot;
                ordered.sort_by(|a, b| a.0.cmp(&b.0));
                for (id, v, s) in ordered {
                    self.waypoints.attach(&id, &v, s, cfg, now);
                }
            } else {
                self.waypoints.attach(memory_id, vector, salience, cfg, now);
            }
        }

        Ok(())
    }

    /// Remove a vector; returns whether it existed
    pub fn delete(&mut self, memory_id: &str) -> bool {
        self.waypoints.detach(memory_id);
        self.entries.remove(memory_id).is_some()
    }

    /// Whether a memory id has a vector here
    pub fn contains(&self, memory_id: &str) -> bool {
        self.entries.contains_key(memory_id)
    }

    /// Fetch a stored vector
    pub fn get(&self, memory_id: &str) -> Option<&[f32]> {
        self.entries.get(memory_id).map(|e| e.vector.as_slice())
    }

    /// Cosine top-k. Tie-break: higher salience, then smaller id.
    pub fn top_k(&self, query: &[f32], k: usize, cfg: &WaypointConfig) -> Vec<(String, f32)> {
        if self.entries.is_empty() || k == 0 {
            return vec![];
        }

        let mut scored: Vec<(String, f32, f32)> =
            if self.layer_active(cfg) && !self.waypoints.is_empty() {
                self.waypoints
                    .probe_members(query, cfg)
                    .into_iter()
                    .filter_map(|id| {
                        self.entries
                            .get(&id)
                            .map(|e| (id, cosine_similarity(query, &e.vector), e.salience))
                    })
                    .collect()
            } else {
                self.entries
                    .iter()
                    .map(|(id, e)| {
                        (
                            id.clone(),
                            cosine_similarity(query, &e.vector),
                            e.salience,
                        )
                    })
                    .collect()
            };

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored.into_iter().map(|(id, cos, _)| (id, cos)).collect()
    }

    /// Batch-refresh salience hints (one write-lock acquisition per sweep)
    /// and recompute waypoint strengths from them.
    pub fn refresh_salience(&mut self, updates: &[(String, f32)]) {
        let mut touched = false;
        for (id, salience) in updates {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.salience = *salience;
                touched = true;
            }
        }
        if !touched {
            return;
        }
        let saliences: HashMap<String, f32> = self
            .entries
            .iter()
            .map(|(id, e)| (id.clone(), e.salience))
            .collect();
        self.waypoints.refresh_strengths(&saliences);
    }

    /// Prune weak waypoints and reattach orphaned vectors. Orphans rejoin
    /// the nearest surviving centroid within the attach threshold or seed
    /// new waypoints.
    pub fn prune_waypoints(&mut self, cfg: &WaypointConfig, now: DateTime<Utc>) -> (usize, usize) {
        let (pruned, orphans) = self.waypoints.prune(cfg);
        let reassigned = orphans.len();
        for id in orphans {
            if let Some(entry) = self.entries.get(&id) {
                let (vector, salience) = (entry.vector.clone(), entry.salience);
                self.waypoints.attach(&id, &vector, salience, cfg, now);
            }
        }
        (pruned, reassigned)
    }

    /// Routing centroid: mean of waypoint centroids when the layer is live
    pub fn routing_centroid(&self) -> Option<Vec<f32>> {
        self.waypoints.centroid_mean()
    }

    /// Export the waypoint layer for persistence
    pub fn export_waypoints(&self) -> Vec<WaypointRow> {
        self.waypoints.export()
    }

    /// The layer engages once the population exceeds `w_min`, and stays
    /// engaged when centroids were restored from persistence so reloaded
    /// vectors reattach to them.
    fn layer_active(&self, cfg: &WaypointConfig) -> bool {
        self.entries.len() > cfg.w_min || !self.waypoints.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> WaypointConfig {
        WaypointConfig::default()
    }

    fn unit(mut v: Vec<f32>) -> Vec<f32> {
        crate::embed::l2_normalize(&mut v);
        v
    }

    #[test]
    fn test_dimension_check() {
        let mut index = SectorIndex::new(4);
        let err = index.upsert("m-1", &[1.0, 0.0], 0.5, &cfg(), Utc::now());
        assert!(err.is_err());
    }

    #[test]
    fn test_exact_scan_below_w_min() {
        let mut index = SectorIndex::new(4);
        let now = Utc::now();

        index.upsert("m-1", &unit(vec![1.0, 0.0, 0.0, 0.0]), 0.5, &cfg(), now).unwrap();
        index.upsert("m-2", &unit(vec![0.0, 1.0, 0.0, 0.0]), 0.5, &cfg(), now).unwrap();
        index.upsert("m-3", &unit(vec![0.9, 0.1, 0.0, 0.0]), 0.5, &cfg(), now).unwrap();

        // Small population: no waypoints engaged
        assert_eq!(index.waypoint_count(), 0);

        let hits = index.top_k(&unit(vec![1.0, 0.0, 0.0, 0.0]), 2, &cfg());
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "m-1");
        assert_eq!(hits[1].0, "m-3");
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn test_tie_break_salience_then_id() {
        let mut index = SectorIndex::new(2);
        let now = Utc::now();
        let v = unit(vec![1.0, 0.0]);

        index.upsert("m-b", &v, 0.9, &cfg(), now).unwrap();
        index.upsert("m-a", &v, 0.5, &cfg(), now).unwrap();
        index.upsert("m-c", &v, 0.9, &cfg(), now).unwrap();

        let hits = index.top_k(&v, 3, &cfg());
        // Equal cosine: salience desc, then id asc
        assert_eq!(hits[0].0, "m-b");
        assert_eq!(hits[1].0, "m-c");
        assert_eq!(hits[2].0, "m-a");
    }

    #[test]
    fn test_upsert_replaces() {
        let mut index = SectorIndex::new(2);
        let now = Utc::now();

        index.upsert("m-1", &unit(vec![1.0, 0.0]), 0.5, &cfg(), now).unwrap();
        index.upsert("m-1", &unit(vec![0.0, 1.0]), 0.5, &cfg(), now).unwrap();
        assert_eq!(index.len(), 1);

        let hits = index.top_k(&unit(vec![0.0, 1.0]), 1, &cfg());
        assert!((hits[0].1 - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_delete() {
        let mut index = SectorIndex::new(2);
        let now = Utc::now();
        index.upsert("m-1", &unit(vec![1.0, 0.0]), 0.5, &cfg(), now).unwrap();

        assert!(index.delete("m-1"));
        assert!(!index.delete("m-1"));
        assert!(index.top_k(&unit(vec![1.0, 0.0]), 1, &cfg()).is_empty());
    }

    #[test]
    fn test_waypoints_bootstrap_past_w_min() {
        let mut small = WaypointConfig {
            w_min: 8,
            ..WaypointConfig::default()
        };
        small.probe = 2;

        let mut index = SectorIndex::new(4);
        let now = Utc::now();

        for i in 0..16 {
            // Two well-separated clusters
            let v = if i % 2 == 0 {
                unit(vec![1.0, 0.01 * i as f32, 0.0, 0.0])
            } else {
                unit(vec![0.0, 0.01 * i as f32, 1.0, 0.0])
            };
            index
                .upsert(&format!("m-{:02}", i), &v, 0.5, &small, now)
                .unwrap();
        }

        assert!(index.waypoint_count() >= 2);

        // Probing still finds the right cluster
        let hits = index.top_k(&unit(vec![1.0, 0.0, 0.0, 0.0]), 4, &small);
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|(id, _)| {
            let n: usize = id[2..].parse().unwrap();
            n % 2 == 0
        }));
    }

    #[test]
    fn test_full_probe_equals_exact_scan() {
        let mut cfg_small = WaypointConfig {
            w_min: 4,
            ..WaypointConfig::default()
        };
        let exact_cfg = WaypointConfig {
            w_min: 1000,
            ..WaypointConfig::default()
        };

        let mut probed_index = SectorIndex::new(4);
        let mut exact_index = SectorIndex::new(4);
        let now = Utc::now();
        for i in 0..12 {
            let v = unit(vec![(i as f32).sin(), (i as f32).cos(), 0.3, 0.1]);
            let id = format!("m-{:02}", i);
            probed_index.upsert(&id, &v, 0.5, &cfg_small, now).unwrap();
            exact_index.upsert(&id, &v, 0.5, &exact_cfg, now).unwrap();
        }

        let q = unit(vec![0.5, 0.5, 0.3, 0.1]);

        // Probe everything: restricted scan must match the exact ordering
        cfg_small.probe = probed_index.waypoint_count().max(1);
        let probed = probed_index.top_k(&q, 5, &cfg_small);
        let exact = exact_index.top_k(&q, 5, &exact_cfg);

        assert_eq!(probed, exact);
    }

    #[test]
    fn test_refresh_salience_changes_tie_break() {
        let mut index = SectorIndex::new(2);
        let now = Utc::now();
        let v = unit(vec![1.0, 0.0]);

        index.upsert("m-a", &v, 0.2, &cfg(), now).unwrap();
        index.upsert("m-b", &v, 0.8, &cfg(), now).unwrap();
        assert_eq!(index.top_k(&v, 1, &cfg())[0].0, "m-b");

        index.refresh_salience(&[("m-a".to_string(), 0.95)]);
        assert_eq!(index.top_k(&v, 1, &cfg())[0].0, "m-a");
    }
}
