//! Waypoint layer
//!
//! Coarse centroids grouping a sector's vectors. Inserts attach to the
//! nearest centroid within the attach threshold or seed a new waypoint;
//! queries probe the strongest few centroids and scan only their members.
//! Online k-means-lite: centroids drift incrementally, no re-clustering.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::config::WaypointConfig;
use crate::embed::cosine_similarity;

// ============================================================================
// TYPES
// ============================================================================

/// One coarse centroid and its members
#[derive(Debug, Clone)]
pub struct Waypoint {
    /// Waypoint id
    pub id: String,
    /// Centroid vector (not necessarily unit length)
    pub centroid: Vec<f32>,
    /// Member memory ids
    pub members: HashSet<String>,
    /// Aggregate salience of members
    pub strength: f32,
    /// Last structural change
    pub last_updated: DateTime<Utc>,
}

/// Persistable waypoint row (members are rebuilt at load)
#[derive(Debug, Clone)]
pub struct WaypointRow {
    /// Waypoint id
    pub id: String,
    /// Centroid vector
    pub centroid: Vec<f32>,
    /// Member count at export time
    pub member_count: usize,
    /// Strength at export time
    pub strength: f32,
    /// Last structural change
    pub last_updated: DateTime<Utc>,
}

/// The waypoint layer of one sector index
#[derive(Debug, Default)]
pub struct WaypointLayer {
    waypoints: HashMap<String, Waypoint>,
    membership: HashMap<String, String>,
}

impl WaypointLayer {
    /// Rebuild a layer from persisted centroids; membership starts empty
    /// and is restored by re-attaching each loaded vector.
    pub fn from_rows(rows: Vec<WaypointRow>) -> Self {
        let waypoints = rows
            .into_iter()
            .map(|row| {
                (
                    row.id.clone(),
                    Waypoint {
                        id: row.id,
                        centroid: row.centroid,
                        members: HashSet::new(),
                        strength: 0.0,
                        last_updated: row.last_updated,
                    },
                )
            })
            .collect();
        Self {
            waypoints,
            membership: HashMap::new(),
        }
    }

    /// Number of waypoints
    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    /// Whether the layer holds no waypoints
    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    /// Attach a vector to the nearest centroid within the attach threshold,
    /// or seed a new waypoint at the vector. Returns the waypoint id.
    pub fn attach(
        &mut self,
        memory_id: &str,
        vector: &[f32],
        salience: f32,
        cfg: &WaypointConfig,
        now: DateTime<Utc>,
    ) -> String {
        self.detach(memory_id);

        let nearest = self
            .waypoints
            .values()
            .map(|wp| (wp.id.clone(), cosine_similarity(vector, &wp.centroid)))
            .filter(|(_, cos)| *cos >= cfg.attach_threshold)
            .max_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.0.cmp(&a.0))
            });

        let wp_id = match nearest {
            Some((id, _)) => {
                let wp = self.waypoints.get_mut(&id).expect("waypoint id from scan");
                wp.members.insert(memory_id.to_string());
                wp.strength += salience;
                // Incremental centroid drift toward the new member
                let n = wp.members.len() as f32;
                for (c, v) in wp.centroid.iter_mut().zip(vector.iter()) {
                    *c += (v - *c) / n;
                }
                wp.last_updated = now;
                id
            }
            None => {
                let id = format!("wp-{}", uuid::Uuid::now_v7());
                let mut members = HashSet::new();
                members.insert(memory_id.to_string());
                self.waypoints.insert(
                    id.clone(),
                    Waypoint {
                        id: id.clone(),
                        centroid: vector.to_vec(),
                        members,
                        strength: salience,
                        last_updated: now,
                    },
                );
                id
            }
        };

        self.membership.insert(memory_id.to_string(), wp_id.clone());
        wp_id
    }

    /// Remove a member; the waypoint stays even when emptied (pruning
    /// collects it later).
    pub fn detach(&mut self, memory_id: &str) {
        if let Some(wp_id) = self.membership.remove(memory_id) {
            if let Some(wp) = self.waypoints.get_mut(&wp_id) {
                wp.members.remove(memory_id);
            }
        }
    }

    /// Member ids of the top `probe` waypoints ranked by
    /// `cos(query, centroid) * strength^alpha`.
    pub fn probe_members(&self, query: &[f32], cfg: &WaypointConfig) -> HashSet<String> {
        let mut scored: Vec<(&Waypoint, f32)> = self
            .waypoints
            .values()
            .map(|wp| {
                let cos = cosine_similarity(query, &wp.centroid);
                (wp, cos * wp.strength.max(0.0).powf(cfg.strength_alpha))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });

        scored
            .iter()
            .take(cfg.probe)
            .flat_map(|(wp, _)| wp.members.iter().cloned())
            .collect()
    }

    /// Recompute strengths from authoritative member saliences
    pub fn refresh_strengths(&mut self, salience_of: &HashMap<String, f32>) {
        for wp in self.waypoints.values_mut() {
            wp.strength = wp
                .members
                .iter()
                .filter_map(|id| salience_of.get(id))
                .sum();
        }
    }

    /// Delete waypoints weaker than the prune threshold with too few
    /// members. Returns the orphaned member ids for reassignment.
    pub fn prune(&mut self, cfg: &WaypointConfig) -> (usize, Vec<String>) {
        let doomed: Vec<String> = self
            .waypoints
            .values()
            .filter(|wp| wp.strength < cfg.prune_threshold && wp.members.len() < cfg.min_members)
            .map(|wp| wp.id.clone())
            .collect();

        let mut orphans = Vec::new();
        for id in &doomed {
            if let Some(wp) = self.waypoints.remove(id) {
                for member in wp.members {
                    self.membership.remove(&member);
                    orphans.push(member);
                }
            }
        }
        orphans.sort();
        (doomed.len(), orphans)
    }

    /// Mean of all centroids, the sector's routing centroid
    pub fn centroid_mean(&self) -> Option<Vec<f32>> {
        let refs: Vec<&[f32]> = self.waypoints.values().map(|wp| wp.centroid.as_slice()).collect();
        crate::embed::mean_vector(&refs)
    }

    /// Export rows for persistence, sorted by id for determinism
    pub fn export(&self) -> Vec<WaypointRow> {
        let mut rows: Vec<WaypointRow> = self
            .waypoints
            .values()
            .map(|wp| WaypointRow {
                id: wp.id.clone(),
                centroid: wp.centroid.clone(),
                member_count: wp.members.len(),
                strength: wp.strength,
                last_updated: wp.last_updated,
            })
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }
}

// ============================================================================
// TESTS
// ============================================================================
