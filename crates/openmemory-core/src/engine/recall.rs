//! Hybrid sectored retrieval
//!
//! Routes a query to sectors, runs the per-sector ANN scans, fuses cosine
//! with salience-times-recency, keyword overlap and cross-sector
//! resonance, deduplicates by memory id and returns a deterministically
//! ordered list. Post-response side effects: winners are reinforced and
//! co-activation edges recorded.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use super::MemoryEngine;
use crate::config::EngineConfig;
use crate::embed::cosine_similarity;
use crate::error::{EngineError, Result};
use crate::index::{keyword_overlap, keywords};
use crate::memory::{resonance, Memory, QueryFilters, QueryMatch, Sector, SectorMap};

impl MemoryEngine {
    /// Retrieve the `k` best memories for a query text
    pub fn query(&self, text: &str, k: usize, filters: &QueryFilters) -> Result<Vec<QueryMatch>> {
        let outcome = self.query_at(text, k, filters, Utc::now());
        self.track(outcome)
    }

    pub(crate) fn query_at(
        &self,
        text: &str,
        k: usize,
        filters: &QueryFilters,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueryMatch>> {
        let cfg = self.config();

        let text = text.trim();
        if text.is_empty() {
            return Err(EngineError::Validation("query must not be empty".into()));
        }
        let k = k.clamp(1, 32);

        let qmap = self.embed_for_query(text)?;
        let routed = self.route_sectors(&qmap, filters, &cfg);

        // Per-sector ANN; a failing scan degrades that sector, not the query
        let fanout_k = k * cfg.fanout;
        let mut hits_by_id: HashMap<String, Vec<(Sector, f32)>> = HashMap::new();
        for sector in &routed {
            match self
                .vectors
                .top_k(*sector, &qmap[*sector], fanout_k, &cfg.waypoint)
            {
                Ok(hits) => {
                    for (id, cos) in hits {
                        hits_by_id.entry(id).or_default().push((*sector, cos));
                    }
                }
                Err(e) => tracing::warn!("{} scan failed, sector skipped: {}", sector, e),
            }
        }
        if hits_by_id.is_empty() {
            return Ok(vec![]);
        }

        let ids: Vec<String> = hits_by_id.keys().cloned().collect();
        let id_refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
        let rows = self.store.get_memories(&id_refs)?;
        let keyword_sets = self.store.keywords_for_ids(&id_refs)?;
        let query_keywords = keywords(text, cfg.keyword_min_length);
        let no_keywords = BTreeSet::new();

        let mut matches: Vec<QueryMatch> = Vec::new();
        for memory in rows {
            if memory.is_tombstoned() || !passes_filters(&memory, filters) {
                continue;
            }
            let Some(hits) = hits_by_id.get(&memory.id) else {
                continue;
            };

            let recency = (-memory.decay_lambda * memory.age_hours(now)).exp();
            let kw = keyword_overlap(
                &query_keywords,
                keyword_sets.get(&memory.id).unwrap_or(&no_keywords),
            );

            // A memory seen from several sectors keeps its best fusion score
            let mut best_score = f32::NEG_INFINITY;
            let mut sectors_hit: Vec<Sector> = Vec::with_capacity(hits.len());
            for (sector, cos) in hits {
                let score = cfg.fusion.cos * cos
                    + cfg.fusion.sal * memory.salience * recency
                    + cfg.fusion.kw * kw
                    + cfg.fusion.res * resonance(*sector, memory.primary_sector);
                if score > best_score {
                    best_score = score;
                }
                sectors_hit.push(*sector);
            }
            sectors_hit.sort_by_key(|s| s.index());
            sectors_hit.dedup();

            matches.push(QueryMatch {
                id: memory.id,
                content: memory.content,
                primary_sector: memory.primary_sector,
                sectors: sectors_hit,
                salience: memory.salience,
                score: best_score,
                path: routed.clone(),
                last_seen_at: memory.last_seen_at,
            });
        }

        // Global order: score desc, last_seen desc, id asc
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.last_seen_at.cmp(&a.last_seen_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        matches.truncate(k);

        self.apply_query_side_effects(&matches, &cfg, now);

        Ok(matches)
    }

    /// Pick the sectors to scan: the caller's pinned set, or the top
    /// `route_max_sectors` by routing weight plus query-centroid cosine.
    fn route_sectors(
        &self,
        qmap: &SectorMap<Vec<f32>>,
        filters: &QueryFilters,
        cfg: &EngineConfig,
    ) -> Vec<Sector> {
        if let Some(pinned) = &filters.sectors {
            if !pinned.is_empty() {
                let mut out: Vec<Sector> = Vec::new();
                for sector in pinned {
                    if !out.contains(sector) {
                        out.push(*sector);
                    }
                }
                return out;
            }
        }

        let mut scored: Vec<(Sector, f32)> = Sector::ALL
            .into_iter()
            .map(|sector| {
                // Routing anchor: mean waypoint centroid when the sector
                // has a live layer, else its identity vector.
                let centroid = self
                    .vectors
                    .routing_centroid(sector)
                    .ok()
                    .flatten();
                let anchor = centroid.as_deref().unwrap_or(&self.identity[sector]);
                let score =
                    cfg.sectors[sector].routing_weight + cosine_similarity(&qmap[sector], anchor);
                (sector, score)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.index().cmp(&b.0.index()))
        });
        scored.truncate(cfg.route_max_sectors);
        scored.into_iter().map(|(sector, _)| sector).collect()
    }

    /// Post-response effects: winners get the implicit salience bump and a
    /// fresh `last_seen_at`; result pairs co-activate in both directions.
    fn apply_query_side_effects(
        &self,
        matches: &[QueryMatch],
        cfg: &EngineConfig,
        now: DateTime<Utc>,
    ) {
        for m in matches {
            if let Err(e) = self.bump_on_hit(&m.id, cfg.retrieval_boost, now) {
                tracing::warn!("Retrieval bump failed for {}: {}", m.id, e);
            }
        }

        if matches.len() < 2 {
            return;
        }
        let mut pairs: Vec<(String, String)> = Vec::new();
        for i in 0..matches.len() {
            for j in (i + 1)..matches.len() {
                pairs.push((matches[i].id.clone(), matches[j].id.clone()));
                pairs.push((matches[j].id.clone(), matches[i].id.clone()));
            }
        }
        if let Err(e) = self
            .store
            .bump_edges(&pairs, "associative", cfg.coactivation_boost, now)
        {
            tracing::warn!("Co-activation edge bump failed: {}", e);
        }
    }
}

fn passes_filters(memory: &Memory, filters: &QueryFilters) -> bool {
    if let Some(min_salience) = filters.min_salience {
        if memory.salience < min_salience {
            return false;
        }
    }
    if let Some(user) = &filters.user_id {
        if memory.user_id.as_deref() != Some(user.as_str()) {
            return false;
        }
    }
    if let Some(tags) = &filters.tags {
        if !tags.iter().all(|tag| memory.tags.contains(tag)) {
            return false;
        }
    }
    true
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::AddInput;
    use tempfile::TempDir;

    fn open_engine() -> (TempDir, MemoryEngine) {
        let dir = TempDir::new().unwrap();
        let engine = MemoryEngine::with_defaults(Some(dir.path().join("engine.db"))).unwrap();
        (dir, engine)
    }

    fn add(engine: &MemoryEngine, content: &str) -> String {
        engine.add(AddInput::new(content)).unwrap().id
    }

    #[test]
    fn test_empty_store_returns_empty() {
        let (_dir, engine) = open_engine();
        let results = engine.query("anything at all", 5, &QueryFilters::default()).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_add_then_query_finds_it() {
        let (_dir, engine) = open_engine();
        let id = add(&engine, "The quick brown fox");

        let results = engine.query("quick fox", 5, &QueryFilters::default()).unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].id, id);
        assert!(results[0].score > 0.3);
        assert_eq!(results[0].primary_sector, Sector::Semantic);
        assert!(!results[0].path.is_empty());
    }

    #[test]
    fn test_query_validation() {
        let (_dir, engine) = open_engine();
        let err = engine.query("  ", 5, &QueryFilters::default()).unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn test_results_sorted_and_bounded() {
        let (_dir, engine) = open_engine();
        let topics = [
            "lifetimes", "borrowing", "ownership", "traits", "closures", "generics", "macros",
            "unsafe",
        ];
        for topic in topics {
            add(&engine, &format!("rust chapter covering {} in depth", topic));
        }

        let results = engine
            .query("rust lifetimes", 4, &QueryFilters::default())
            .unwrap();
        assert_eq!(results.len(), 4);
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_k_is_clamped() {
        let (_dir, engine) = open_engine();
        add(&engine, "single entry about gardening");

        // k = 0 behaves as k = 1
        let results = engine.query("gardening", 0, &QueryFilters::default()).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_min_salience_filter() {
        let (_dir, engine) = open_engine();
        add(&engine, "a fact about volcanoes");

        let filters = QueryFilters {
            min_salience: Some(0.9),
            ..Default::default()
        };
        assert!(engine.query("volcanoes", 5, &filters).unwrap().is_empty());

        let filters = QueryFilters {
            min_salience: Some(0.1),
            ..Default::default()
        };
        assert_eq!(engine.query("volcanoes", 5, &filters).unwrap().len(), 1);
    }

    #[test]
    fn test_user_and_tag_filters() {
        let (_dir, engine) = open_engine();

        let mut input = AddInput::new("team standup notes from tuesday");
        input.user_id = Some("u-1".to_string());
        input.tags = vec!["standup".to_string()];
        engine.add(input).unwrap();

        let filters = QueryFilters {
            user_id: Some("u-2".to_string()),
            ..Default::default()
        };
        assert!(engine.query("standup notes", 5, &filters).unwrap().is_empty());

        let filters = QueryFilters {
            user_id: Some("u-1".to_string()),
            tags: Some(vec!["standup".to_string()]),
            ..Default::default()
        };
        assert_eq!(engine.query("standup notes", 5, &filters).unwrap().len(), 1);

        let filters = QueryFilters {
            tags: Some(vec!["retro".to_string()]),
            ..Default::default()
        };
        assert!(engine.query("standup notes", 5, &filters).unwrap().is_empty());
    }

    #[test]
    fn test_sector_pinning_restricts_routing() {
        let (_dir, engine) = open_engine();
        add(&engine, "simple mode files everything under semantic");

        let filters = QueryFilters {
            sectors: Some(vec![Sector::Episodic]),
            ..Default::default()
        };
        let results = engine.query("semantic files", 5, &filters).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_multi_sector_memory_appears_once() {
        let (_dir, engine) = open_engine();
        let id = add(&engine, "shared across sectors");
        let cfg = engine.config();
        let now = Utc::now();

        // File the same vector under a second sector by hand
        let vector = engine
            .store
            .vectors_for(&id)
            .unwrap()
            .into_iter()
            .next()
            .unwrap()
            .1;
        engine
            .vectors
            .upsert(Sector::Episodic, &id, &vector, 0.5, &cfg.waypoint, now)
            .unwrap();

        let filters = QueryFilters {
            sectors: Some(vec![Sector::Semantic, Sector::Episodic]),
            ..Default::default()
        };
        let results = engine.query("shared across sectors", 5, &filters).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].sectors, vec![Sector::Episodic, Sector::Semantic]);
        assert_eq!(results[0].path, vec![Sector::Semantic, Sector::Episodic]);
    }

    #[test]
    fn test_query_side_effects_bump_winners() {
        let (_dir, engine) = open_engine();
        let id = add(&engine, "memory that will be retrieved");
        let before = engine.store.get_memory(&id).unwrap().unwrap();

        engine.query("memory retrieved", 5, &QueryFilters::default()).unwrap();

        let after = engine.store.get_memory(&id).unwrap().unwrap();
        // s' = s + 0.05 * (1 - s)
        let expected = before.salience + 0.05 * (1.0 - before.salience);
        assert!((after.salience - expected).abs() < 1e-4);
        assert!(after.last_seen_at >= before.last_seen_at);
        assert!(after.version > before.version);
    }

    #[test]
    fn test_coactivation_edges_recorded() {
        let (_dir, engine) = open_engine();
        let a = add(&engine, "rust ownership rules explained");
        let b = add(&engine, "rust borrowing rules explained");

        let results = engine
            .query("rust rules explained", 5, &QueryFilters::default())
            .unwrap();
        assert_eq!(results.len(), 2);

        let edges = engine.store.edges_from(&a).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].dst_id, b);
        assert!((edges[0].weight - 0.02).abs() < 1e-4);

        // Both directions exist
        assert_eq!(engine.store.edges_from(&b).unwrap().len(), 1);
    }

    #[test]
    fn test_deleted_memory_never_returned() {
        let (_dir, engine) = open_engine();
        let id = add(&engine, "memory to be deleted shortly");
        engine.delete(&id).unwrap();

        let results = engine
            .query("memory deleted shortly", 5, &QueryFilters::default())
            .unwrap();
        assert!(results.iter().all(|m| m.id != id));
    }
}
