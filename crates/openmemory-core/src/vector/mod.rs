//! Vector store
//!
//! One logical index per sector behind a per-sector reader-writer lock.
//! `top_k` takes a read lock; `upsert`/`delete` take a write lock; decay
//! sweeps refresh salience hints with a single write acquisition per
//! sector. Contents are rebuilt from the `vectors` table at startup.

mod sector_index;
mod waypoint;

pub use sector_index::SectorIndex;
pub use waypoint::{Waypoint, WaypointLayer, WaypointRow};

use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::config::WaypointConfig;
use crate::memory::{Sector, SectorMap};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Vector store error types
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum VectorStoreError {
    /// Vector width does not match the index
    DimensionMismatch {
        /// Configured width
        expected: usize,
        /// Provided width
        got: usize,
    },
    /// A sector lock was poisoned by a panicking writer
    LockPoisoned(Sector),
}

impl std::fmt::Display for VectorStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VectorStoreError::DimensionMismatch { expected, got } => {
                write!(f, "Invalid dimensions: expected {}, got {}", expected, got)
            }
            VectorStoreError::LockPoisoned(sector) => {
                write!(f, "{} index lock poisoned", sector)
            }
        }
    }
}

impl std::error::Error for VectorStoreError {}

// ============================================================================
// VECTOR STORE
// ============================================================================

/// All five sector indexes
pub struct VectorStore {
    sectors: SectorMap<RwLock<SectorIndex>>,
}

impl VectorStore {
    /// Create empty indexes of the given width
    pub fn new(dimensions: usize) -> Self {
        Self {
            sectors: SectorMap::from_fn(|_| RwLock::new(SectorIndex::new(dimensions))),
        }
    }

    /// Create indexes seeded with persisted waypoint centroids
    pub fn with_waypoints(dimensions: usize, mut rows: SectorMap<Vec<WaypointRow>>) -> Self {
        Self {
            sectors: SectorMap::from_fn(|sector| {
                RwLock::new(SectorIndex::with_waypoints(
                    dimensions,
                    std::mem::take(&mut rows[sector]),
                ))
            }),
        }
    }

    /// Insert or replace one sector vector
    pub fn upsert(
        &self,
        sector: Sector,
        memory_id: &str,
        vector: &[f32],
        salience: f32,
        cfg: &WaypointConfig,
        now: DateTime<Utc>,
    ) -> Result<(), VectorStoreError> {
        let mut index = self.sectors[sector]
            .write()
            .map_err(|_| VectorStoreError::LockPoisoned(sector))?;
        index.upsert(memory_id, vector, salience, cfg, now)
    }

    /// Cosine top-k within one sector
    pub fn top_k(
        &self,
        sector: Sector,
        query: &[f32],
        k: usize,
        cfg: &WaypointConfig,
    ) -> Result<Vec<(String, f32)>, VectorStoreError> {
        let index = self.sectors[sector]
            .read()
            .map_err(|_| VectorStoreError::LockPoisoned(sector))?;
        Ok(index.top_k(query, k, cfg))
    }

    /// Bulk fetch of stored vectors by id, across all sectors
    pub fn by_ids(&self, ids: &[&str]) -> Result<Vec<(String, Sector, Vec<f32>)>, VectorStoreError> {
        let mut out = Vec::new();
        for sector in Sector::ALL {
            let index = self.sectors[sector]
                .read()
                .map_err(|_| VectorStoreError::LockPoisoned(sector))?;
            for id in ids {
                if let Some(v) = index.get(id) {
                    out.push((id.to_string(), sector, v.to_vec()));
                }
            }
        }
        Ok(out)
    }

    /// Remove a memory's vectors from every sector; returns sectors touched
    pub fn delete(&self, memory_id: &str) -> Result<usize, VectorStoreError> {
        let mut removed = 0;
        for sector in Sector::ALL {
            let mut index = self.sectors[sector]
                .write()
                .map_err(|_| VectorStoreError::LockPoisoned(sector))?;
            if index.delete(memory_id) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Population of one sector
    pub fn len(&self, sector: Sector) -> Result<usize, VectorStoreError> {
        let index = self.sectors[sector]
            .read()
            .map_err(|_| VectorStoreError::LockPoisoned(sector))?;
        Ok(index.len())
    }

    /// Whether a sector index is empty
    pub fn is_empty(&self, sector: Sector) -> Result<bool, VectorStoreError> {
        Ok(self.len(sector)? == 0)
    }

    /// Routing centroid of a sector (mean waypoint centroid), if the
    /// sector has a live waypoint layer
    pub fn routing_centroid(&self, sector: Sector) -> Result<Option<Vec<f32>>, VectorStoreError> {
        let index = self.sectors[sector]
            .read()
            .map_err(|_| VectorStoreError::LockPoisoned(sector))?;
        Ok(index.routing_centroid())
    }

    /// Batch salience refresh for one sector (single write acquisition)
    pub fn refresh_salience(
        &self,
        sector: Sector,
        updates: &[(String, f32)],
    ) -> Result<(), VectorStoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut index = self.sectors[sector]
            .write()
            .map_err(|_| VectorStoreError::LockPoisoned(sector))?;
        index.refresh_salience(updates);
        Ok(())
    }

    /// Prune weak waypoints in one sector; returns (pruned, reassigned)
    pub fn prune_waypoints(
        &self,
        sector: Sector,
        cfg: &WaypointConfig,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize), VectorStoreError> {
        let mut index = self.sectors[sector]
            .write()
            .map_err(|_| VectorStoreError::LockPoisoned(sector))?;
        Ok(index.prune_waypoints(cfg, now))
    }

    /// Export one sector's waypoint layer for persistence
    pub fn export_waypoints(&self, sector: Sector) -> Result<Vec<WaypointRow>, VectorStoreError> {
        let index = self.sectors[sector]
            .read()
            .map_err(|_| VectorStoreError::LockPoisoned(sector))?;
        Ok(index.export_waypoints())
    }
}

// ============================================================================
// TESTS
// ============================================================================
