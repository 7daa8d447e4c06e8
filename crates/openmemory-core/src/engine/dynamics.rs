//! Lifecycle dynamics
//!
//! Salience reinforcement, exponential time decay with per-sector floors
//! and tombstoning, associative reinforcement propagation, and the weekly
//! pruning pass over waypoints, edges and the keyword index.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use super::MemoryEngine;
use crate::error::{EngineError, Result};
use crate::memory::{DecayReport, PropagationOutcome, PruneReport, ReinforceOutcome, Sector};
use crate::store::DecayUpdate;

impl MemoryEngine {
    // ========================================================================
    // REINFORCEMENT
    // ========================================================================

    /// Explicit reinforcement: `s' = clamp(s * (1 + boost), 0, 1)`.
    /// Does not move the decay anchor; importance and recency are
    /// separate signals.
    pub fn reinforce(&self, id: &str, boost: f32) -> Result<ReinforceOutcome> {
        let outcome = self.reinforce_at(id, boost, Utc::now());
        self.track(outcome)
    }

    pub(crate) fn reinforce_at(
        &self,
        id: &str,
        boost: f32,
        now: DateTime<Utc>,
    ) -> Result<ReinforceOutcome> {
        if !(0.01..=1.0).contains(&boost) {
            return Err(EngineError::Validation(format!(
                "boost must be in [0.01, 1], got {}",
                boost
            )));
        }

        for _attempt in 0..2 {
            let memory = self
                .store
                .get_memory(id)?
                .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
            if memory.is_tombstoned() {
                return Err(EngineError::NotFound(id.to_string()));
            }

            let salience = (memory.salience * (1.0 + boost)).clamp(0.0, 1.0);
            if self
                .store
                .update_salience(id, memory.version, salience, false, now)?
            {
                self.refresh_salience_hint(id, salience);
                return Ok(ReinforceOutcome {
                    id: id.to_string(),
                    salience,
                });
            }
        }
        Err(EngineError::Conflict(id.to_string()))
    }

    /// Implicit reinforcement on retrieval hit: `s' = s + beta * (1 - s)`
    /// plus a fresh `last_seen_at`. Conflicts retry once, then the hit is
    /// dropped (the result already shipped).
    pub(crate) fn bump_on_hit(&self, id: &str, beta: f32, now: DateTime<Utc>) -> Result<()> {
        for _attempt in 0..2 {
            let Some(memory) = self.store.get_memory(id)? else {
                return Ok(());
            };
            if memory.is_tombstoned() {
                return Ok(());
            }

            let salience = (memory.salience + beta * (1.0 - memory.salience)).clamp(0.0, 1.0);
            if self
                .store
                .update_salience(id, memory.version, salience, true, now)?
            {
                self.refresh_salience_hint(id, salience);
                return Ok(());
            }
        }
        tracing::debug!("Salience bump on {} lost the race twice", id);
        Ok(())
    }

    /// Push a fresh salience hint into every sector index holding the id
    pub(crate) fn refresh_salience_hint(&self, id: &str, salience: f32) {
        let update = [(id.to_string(), salience)];
        for sector in Sector::ALL {
            if let Err(e) = self.vectors.refresh_salience(sector, &update) {
                tracing::warn!("Salience hint refresh failed in {}: {}", sector, e);
            }
        }
    }

    // ========================================================================
    // DECAY
    // ========================================================================

    /// Run a decay sweep at the current instant
    pub fn run_decay(&self) -> Result<DecayReport> {
        self.run_decay_at(Utc::now())
    }

    /// Decay sweep driven by an explicit clock.
    ///
    /// For each live memory: `s' = max(floor, s * exp(-lambda * dt))` with
    /// `dt` measured from the decay anchor. Memories whose unfloored value
    /// fell under the floor and that have gone unseen past the grace
    /// period are tombstoned; tombstones from earlier sweeps are purged.
    pub fn run_decay_at(&self, now: DateTime<Utc>) -> Result<DecayReport> {
        let cfg = self.config();

        let purged = self.store.purge_tombstoned_before(now)?;

        let memories = self.store.active_memories()?;
        let mut report = DecayReport {
            purged,
            ..Default::default()
        };
        let mut updates: Vec<DecayUpdate> = Vec::new();

        for memory in &memories {
            report.processed += 1;

            let dt_hours = (now - memory.decay_anchor()).num_seconds().max(0) as f32 / 3600.0;
            if dt_hours <= 0.0 {
                continue;
            }

            let floor = cfg.sectors[memory.primary_sector].min_salience_floor;
            let raw = memory.salience * (-memory.decay_lambda * dt_hours).exp();
            let salience = raw.max(floor);

            let unseen_days = (now - memory.last_seen_at).num_days();
            let tombstone = raw < floor && unseen_days > cfg.grace_days;

            if tombstone {
                report.tombstoned += 1;
                updates.push(DecayUpdate {
                    id: memory.id.clone(),
                    salience,
                    tombstone: true,
                });
            } else if (salience - memory.salience).abs() > 1e-6 {
                report.decayed += 1;
                updates.push(DecayUpdate {
                    id: memory.id.clone(),
                    salience,
                    tombstone: false,
                });
            }
        }

        self.store.apply_decay_updates(&updates, now)?;

        // Mirror the sweep into the sector indexes: drop tombstones, then
        // refresh salience hints batch-wise (one write lock per sector).
        let mut refresh: Vec<(String, f32)> = Vec::new();
        for update in &updates {
            if update.tombstone {
                if let Err(e) = self.vectors.delete(&update.id) {
                    tracing::warn!("Index delete failed for {}: {}", update.id, e);
                }
            } else {
                refresh.push((update.id.clone(), update.salience));
            }
        }
        for sector in Sector::ALL {
            if let Err(e) = self.vectors.refresh_salience(sector, &refresh) {
                tracing::warn!("Salience refresh failed in {}: {}", sector, e);
            }
        }

        if let Err(e) = self.store.log_stat("decay", report.decayed as i64, now) {
            tracing::warn!("Could not log decay stat: {}", e);
        }
        self.flush_request_stats(now);

        Ok(report)
    }

    // ========================================================================
    // PROPAGATION
    // ========================================================================

    /// Walk the associative graph outward from a source memory, boosting
    /// reached memories and traversed edges.
    pub fn propagate(
        &self,
        src_id: &str,
        delta: f32,
        depth: Option<usize>,
    ) -> Result<PropagationOutcome> {
        let outcome = self.propagate_at(src_id, delta, depth, Utc::now());
        self.track(outcome)
    }

    pub(crate) fn propagate_at(
        &self,
        src_id: &str,
        delta: f32,
        depth: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<PropagationOutcome> {
        if !(delta > 0.0 && delta <= 1.0) {
            return Err(EngineError::Validation(format!(
                "delta must be in (0, 1], got {}",
                delta
            )));
        }
        let cfg = self.config();
        let max_depth = depth.unwrap_or(cfg.propagation_depth).min(6);

        let source = self
            .store
            .get_memory(src_id)?
            .ok_or_else(|| EngineError::NotFound(src_id.to_string()))?;
        if source.is_tombstoned() {
            return Err(EngineError::NotFound(src_id.to_string()));
        }

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(src_id.to_string());

        // (memory id, cumulative path weight)
        let mut frontier: Vec<(String, f32)> = vec![(src_id.to_string(), 1.0)];
        let mut updated_ids: Vec<String> = Vec::new();
        // Edge bumps batched per depth: w' = clamp(w + delta * 0.1 / d)
        let mut edge_bumps_by_depth: Vec<Vec<(String, String)>> = Vec::new();

        for depth_now in 1..=max_depth {
            let mut next: Vec<(String, f32)> = Vec::new();
            let mut bumped: Vec<(String, String)> = Vec::new();

            for (node, path_weight) in &frontier {
                for edge in self.store.edges_from(node)? {
                    if visited.contains(&edge.dst_id) || edge.dst_id == *node {
                        continue;
                    }
                    visited.insert(edge.dst_id.clone());

                    let reached_weight = path_weight * edge.weight;
                    let contribution = delta * reached_weight * 0.5_f32.powi(depth_now as i32);

                    if self.apply_propagation_boost(&edge.dst_id, contribution, now)? {
                        updated_ids.push(edge.dst_id.clone());
                    }
                    bumped.push((node.clone(), edge.dst_id.clone()));
                    next.push((edge.dst_id.clone(), reached_weight));
                }
            }

            edge_bumps_by_depth.push(bumped);
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        for (i, bumps) in edge_bumps_by_depth.iter().enumerate() {
            let depth_at = (i + 1) as f32;
            if let Err(e) =
                self.store
                    .bump_edges(bumps, "associative", delta * 0.1 / depth_at, now)
            {
                tracing::warn!("Edge bump batch failed: {}", e);
            }
        }

        Ok(PropagationOutcome { updated_ids })
    }

    /// Additive salience boost with one conflict retry; missing or
    /// tombstoned targets are skipped (dangling edges clean up later).
    fn apply_propagation_boost(
        &self,
        id: &str,
        contribution: f32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        for _attempt in 0..2 {
            let Some(memory) = self.store.get_memory(id)? else {
                return Ok(false);
            };
            if memory.is_tombstoned() {
                return Ok(false);
            }
            let salience = (memory.salience + contribution).clamp(0.0, 1.0);
            if self
                .store
                .update_salience(id, memory.version, salience, false, now)?
            {
                self.refresh_salience_hint(id, salience);
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ========================================================================
    // PRUNING
    // ========================================================================

    /// Weekly pruning: weak waypoints, decayed edges, oversized keyword
    /// postings. Persists the surviving waypoint layers.
    pub fn run_prune(&self) -> Result<PruneReport> {
        self.run_prune_at(Utc::now())
    }

    pub(crate) fn run_prune_at(&self, now: DateTime<Utc>) -> Result<PruneReport> {
        let cfg = self.config();
        let mut report = PruneReport::default();

        for sector in Sector::ALL {
            match self.vectors.prune_waypoints(sector, &cfg.waypoint, now) {
                Ok((pruned, reassigned)) => {
                    report.waypoints_pruned += pruned as u64;
                    report.vectors_reassigned += reassigned as u64;
                }
                Err(e) => {
                    tracing::warn!("Waypoint prune failed in {}: {}", sector, e);
                    continue;
                }
            }
            match self.vectors.export_waypoints(sector) {
                Ok(rows) => {
                    if let Err(e) = self.store.replace_waypoints(sector, &rows) {
                        tracing::warn!("Waypoint persist failed in {}: {}", sector, e);
                    }
                }
                Err(e) => tracing::warn!("Waypoint export failed in {}: {}", sector, e),
            }
        }

        report.edges_pruned = self.store.decay_and_prune_edges(
            cfg.edge_half_life_hours,
            cfg.edge_prune_threshold,
            now,
        )?;

        let trimmed = self.store.trim_keyword_index(cfg.keyword_index_cap)?;
        if trimmed > 0 {
            tracing::debug!(trimmed, "Keyword index trimmed");
        }

        if let Err(e) = self
            .store
            .log_stat("prune", report.waypoints_pruned as i64, now)
        {
            tracing::warn!("Could not log prune stat: {}", e);
        }

        Ok(report)
    }
}

// ============================================================================
// TESTS
// ============================================================================
