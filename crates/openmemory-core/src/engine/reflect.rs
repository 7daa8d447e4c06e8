//! Reflection and consolidation
//!
//! Clusters recent near-duplicate memories per user and sector, distills
//! each cluster into a synthetic memory in the `reflective` sector, and
//! marks the sources consolidated. Also rebuilds derived user summaries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::MemoryEngine;
use crate::error::Result;
use crate::index::{hamming_distance, jaccard, keywords, simhash};
use crate::memory::{Memory, Metadata, ReflectionReport, Sector};

impl MemoryEngine {
    /// Run reflection unconditionally over whatever recent memories exist
    pub fn run_reflection(&self) -> Result<ReflectionReport> {
        let outcome = self.run_reflection_at(Utc::now(), false);
        self.track(outcome)
    }

    /// Scheduled variant: a user's group must reach `reflect_min` recent
    /// memories before it is considered.
    pub(crate) fn run_reflection_scheduled(&self) -> Result<ReflectionReport> {
        self.run_reflection_at(Utc::now(), true)
    }

    pub(crate) fn run_reflection_at(
        &self,
        now: DateTime<Utc>,
        enforce_min: bool,
    ) -> Result<ReflectionReport> {
        let cfg = self.config();
        let recent = self.store.recent_memories(cfg.reflect_scan_limit)?;

        let mut by_user: BTreeMap<Option<String>, Vec<Memory>> = BTreeMap::new();
        for memory in recent {
            by_user.entry(memory.user_id.clone()).or_default().push(memory);
        }

        let mut report = ReflectionReport::default();
        let mut sources_marked = 0_u64;

        for (user, group) in by_user {
            if enforce_min && group.len() < cfg.reflect_min {
                continue;
            }

            for sector in Sector::ALL {
                // Reflections never reflect over reflections
                if sector == Sector::Reflective {
                    continue;
                }

                let mut members: Vec<&Memory> = group
                    .iter()
                    .filter(|m| {
                        m.primary_sector == sector
                            && !m.metadata.consolidated
                            && !m.metadata.auto_reflect
                    })
                    .collect();
                members.sort_by(|a, b| a.id.cmp(&b.id));

                for cluster in cluster_members(
                    &members,
                    cfg.simhash_hamming_threshold,
                    cfg.keyword_min_length,
                ) {
                    if cluster.len() < 2 {
                        continue;
                    }
                    report.clusters += 1;
                    self.consolidate_cluster(user.as_deref(), sector, &cluster, now)?;
                    report.created += 1;
                    sources_marked += cluster.len() as u64;
                }
            }
        }

        if let Err(e) = self.store.log_stat("reflect", report.created as i64, now) {
            tracing::warn!("Could not log reflect stat: {}", e);
        }
        if sources_marked > 0 {
            if let Err(e) = self
                .store
                .log_stat("consolidate", sources_marked as i64, now)
            {
                tracing::warn!("Could not log consolidate stat: {}", e);
            }
        }

        Ok(report)
    }

    /// Distill one cluster into a reflective memory and mark its sources
    fn consolidate_cluster(
        &self,
        user: Option<&str>,
        sector: Sector,
        cluster: &[&Memory],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let cfg = self.config();
        let n = cluster.len();

        let avg_recency: f32 = cluster
            .iter()
            .map(|m| {
                let dt_hours = (now - m.created_at).num_seconds().max(0) as f32 / 3600.0;
                (-dt_hours / 12.0).exp()
            })
            .sum::<f32>()
            / n as f32;
        let has_emotional = if sector == Sector::Emotional { 1.0 } else { 0.0 };
        let cluster_salience = (0.6 * (n as f32 / 10.0).min(1.0)
            + 0.3 * avg_recency
            + 0.1 * has_emotional)
            .clamp(0.0, 1.0);

        let mut snippets = String::new();
        for member in cluster {
            if !snippets.is_empty() {
                snippets.push_str("; ");
            }
            snippets.push_str(member.content.trim());
            if snippets.chars().count() >= 200 {
                break;
            }
        }
        let snippets: String = snippets.chars().take(200).collect();
        let summary = format!("{} {} pattern: {}", n, sector, snippets);

        let (vectors_map, used_fallback) = self.embed_for_write(&summary)?;
        let fingerprint = simhash(&summary, cfg.keyword_min_length);
        let kw = keywords(&summary, cfg.keyword_min_length);

        let metadata = Metadata {
            auto_reflect: true,
            fallback_embedding: used_fallback,
            sources: cluster.iter().map(|m| m.id.clone()).collect(),
            freq: Some(n as u32),
            ..Default::default()
        };

        let reflection = Memory {
            id: Uuid::now_v7().to_string(),
            user_id: user.map(|u| u.to_string()),
            content: summary,
            primary_sector: Sector::Reflective,
            tags: vec!["reflect:auto".to_string()],
            metadata,
            simhash: fingerprint,
            salience: cluster_salience,
            decay_lambda: cfg.sectors[Sector::Reflective].decay_lambda(),
            created_at: now,
            updated_at: now,
            last_seen_at: now,
            decayed_at: None,
            version: 1,
            tombstoned_at: None,
        };

        let vector_rows = vec![(
            Sector::Reflective,
            vectors_map[Sector::Reflective].clone(),
        )];
        self.persist_memory(&reflection, &vector_rows, &kw, now)?;

        for member in cluster {
            let mut meta = member.metadata.clone();
            meta.consolidated = true;
            let boosted = (member.salience * 1.1).min(1.0);
            if !self
                .store
                .update_meta_and_salience(&member.id, &meta, boosted, now)?
            {
                tracing::warn!("Source {} vanished during consolidation", member.id);
                continue;
            }
            self.refresh_salience_hint(&member.id, boosted);
        }

        Ok(())
    }

    // ========================================================================
    // USER SUMMARIES
    // ========================================================================

    /// Rebuild the derived summary of every known user
    pub fn rebuild_user_summaries(&self) -> Result<u64> {
        self.rebuild_user_summaries_at(Utc::now())
    }

    pub(crate) fn rebuild_user_summaries_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut rebuilt = 0_u64;
        for user in self.store.user_ids()? {
            let top = self.store.top_memories_for_user(&user, 5)?;
            if top.is_empty() {
                continue;
            }
            let summary = top
                .iter()
                .map(|m| m.content.trim().chars().take(80).collect::<String>())
                .collect::<Vec<_>>()
                .join("; ");
            if self.store.update_user_summary(&user, &summary, now)? {
                rebuilt += 1;
            }
        }

        if let Err(e) = self.store.log_stat("summary", rebuilt as i64, now) {
            tracing::warn!("Could not log summary stat: {}", e);
        }
        Ok(rebuilt)
    }
}

/// Greedy single-pass clustering: a member joins the first cluster whose
/// representative it is near. Near means Hamming within the threshold when
/// both fingerprints exist, else keyword Jaccard >= 0.5.
fn cluster_members<'a>(
    members: &[&'a Memory],
    hamming_threshold: u32,
    min_token_length: usize,
) -> Vec<Vec<&'a Memory>> {
    let mut clusters: Vec<Vec<&'a Memory>> = Vec::new();
    for &member in members {
        let mut placed = false;
        for cluster in clusters.iter_mut() {
            if near(cluster[0], member, hamming_threshold, min_token_length) {
                cluster.push(member);
                placed = true;
                break;
            }
        }
        if !placed {
            clusters.push(vec![member]);
        }
    }
    clusters
}

fn near(a: &Memory, b: &Memory, hamming_threshold: u32, min_token_length: usize) -> bool {
    if a.simhash != 0 && b.simhash != 0 {
        return hamming_distance(a.simhash, b.simhash) <= hamming_threshold;
    }
    let ka = keywords(&a.content, min_token_length);
    let kb = keywords(&b.content, min_token_length);
    jaccard(&ka, &kb) >= 0.5
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AddInput, ListFilter};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn open_engine() -> (TempDir, MemoryEngine) {
        let dir = TempDir::new().unwrap();
        let engine = MemoryEngine::with_defaults(Some(dir.path().join("engine.db"))).unwrap();
        (dir, engine)
    }

    /// Insert a raw memory row, bypassing sector election
    fn seed_memory(engine: &MemoryEngine, id: &str, content: &str, sector: Sector, user: &str) {
        let now = Utc::now();
        let memory = Memory {
            id: id.to_string(),
            user_id: Some(user.to_string()),
            content: content.to_string(),
            primary_sector: sector,
            tags: vec![],
            metadata: Metadata::default(),
            simhash: simhash(content, 3),
            salience: 0.5,
            decay_lambda: 0.001,
            created_at: now,
            updated_at: now,
            last_seen_at: now,
            decayed_at: None,
            version: 1,
            tombstoned_at: None,
        };
        engine
            .store
            .insert_memory(&memory, &[], &BTreeSet::new())
            .unwrap();
    }

    #[test]
    fn test_reflection_consolidates_cluster() {
        let (_dir, engine) = open_engine();
        let content = "backup the production database before every deploy";
        for i in 0..5 {
            seed_memory(&engine, &format!("m-{}", i), content, Sector::Procedural, "u");
        }

        let report = engine.run_reflection().unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.clusters, 1);

        // The reflection landed in the reflective sector with provenance
        let filter = ListFilter {
            sector: Some(Sector::Reflective),
            ..Default::default()
        };
        let reflections = engine.list(&filter, 10, 0).unwrap();
        assert_eq!(reflections.len(), 1);
        let reflection = &reflections[0];
        assert!(reflection.tags.contains(&"reflect:auto".to_string()));
        assert!(reflection.metadata.auto_reflect);
        assert_eq!(reflection.metadata.freq, Some(5));
        assert_eq!(reflection.metadata.sources.len(), 5);
        assert!(reflection.content.starts_with("5 procedural pattern:"));
        // n=5, fresh cluster: 0.6 * 0.5 + 0.3 * ~1.0
        assert!((reflection.salience - 0.6).abs() < 0.05);

        // Sources are marked and boosted: 0.5 * 1.1
        for i in 0..5 {
            let source = engine.store.get_memory(&format!("m-{}", i)).unwrap().unwrap();
            assert!(source.metadata.consolidated);
            assert!((source.salience - 0.55).abs() < 1e-4);
        }
    }

    #[test]
    fn test_reflection_is_idempotent() {
        let (_dir, engine) = open_engine();
        let content = "water the plants on the balcony every morning";
        for i in 0..3 {
            seed_memory(&engine, &format!("m-{}", i), content, Sector::Procedural, "u");
        }

        assert_eq!(engine.run_reflection().unwrap().created, 1);
        // All sources consolidated: the re-discovered cluster yields nothing
        assert_eq!(engine.run_reflection().unwrap().created, 0);
    }

    #[test]
    fn test_reflection_ignores_singletons() {
        let (_dir, engine) = open_engine();
        seed_memory(
            &engine,
            "m-solo",
            "one of a kind observation about lighthouses",
            Sector::Episodic,
            "u",
        );

        let report = engine.run_reflection().unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(report.clusters, 0);
    }

    #[test]
    fn test_reflection_keeps_users_apart() {
        let (_dir, engine) = open_engine();
        let content = "weekly grocery run includes oat milk and coffee beans";
        seed_memory(&engine, "m-a", content, Sector::Episodic, "user-a");
        seed_memory(&engine, "m-b", content, Sector::Episodic, "user-b");

        // One matching memory per user: no cluster reaches size 2
        let report = engine.run_reflection().unwrap();
        assert_eq!(report.created, 0);
    }

    #[test]
    fn test_scheduled_reflection_enforces_minimum() {
        let (_dir, engine) = open_engine();
        let content = "standup starts at nine thirty sharp";
        for i in 0..5 {
            seed_memory(&engine, &format!("m-{}", i), content, Sector::Episodic, "u");
        }

        // 5 < reflect_min (20): the scheduled pass skips the user
        assert_eq!(engine.run_reflection_scheduled().unwrap().created, 0);
        // The facade runs unconditionally
        assert_eq!(engine.run_reflection().unwrap().created, 1);
    }

    #[test]
    fn test_cluster_members_fallback_to_jaccard() {
        let now = Utc::now();
        let make = |id: &str, content: &str| Memory {
            id: id.to_string(),
            user_id: None,
            content: content.to_string(),
            primary_sector: Sector::Semantic,
            tags: vec![],
            metadata: Metadata::default(),
            simhash: 0, // fingerprint missing
            salience: 0.5,
            decay_lambda: 0.001,
            created_at: now,
            updated_at: now,
            last_seen_at: now,
            decayed_at: None,
            version: 1,
            tombstoned_at: None,
        };

        let a = make("m-a", "solar panel inverter maintenance guide");
        let b = make("m-b", "solar panel inverter maintenance checklist");
        let c = make("m-c", "completely unrelated pottery class notes");

        let members = vec![&a, &b, &c];
        let clusters = cluster_members(&members, 3, 3);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].len(), 2);
    }

    #[test]
    fn test_user_summary_rebuild() {
        let (_dir, engine) = open_engine();
        let mut input = AddInput::new("prefers dark roast coffee in the morning");
        input.user_id = Some("u-1".to_string());
        engine.add(input).unwrap();

        let rebuilt = engine.rebuild_user_summaries().unwrap();
        assert_eq!(rebuilt, 1);

        let user = engine.store.get_user("u-1").unwrap().unwrap();
        let summary = user.summary.unwrap();
        assert!(summary.contains("dark roast"));
        assert!(user.summary_updated_at.is_some());
    }
}
