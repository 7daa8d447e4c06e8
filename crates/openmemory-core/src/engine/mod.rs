//! Memory engine facade
//!
//! The small surface the outside world calls: `add`, `query`, `get`,
//! `list`, `reinforce`, `delete`, `run_decay`, `run_reflection`,
//! `propagate`, plus config snapshot swapping and admission counters.
//!
//! The engine owns the metadata store and the per-sector vector indexes.
//! All methods take `&self`; the engine is `Send + Sync` and lives behind
//! an `Arc` shared with the maintenance scheduler.

mod dynamics;
mod recall;
mod reflect;

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{ConfigPatch, EngineConfig};
use crate::embed::{cosine_similarity, Embedder, SyntheticEmbedder};
use crate::error::{EngineError, Result};
use crate::index::{keywords, simhash};
use crate::memory::{
    AddInput, AddOutcome, ListFilter, Memory, Metadata, Sector, SectorMap,
};
use crate::store::MetadataStore;
use crate::vector::VectorStore;

// ============================================================================
// COUNTERS
// ============================================================================

/// Cheap admission counters for external middleware
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountersSnapshot {
    /// Facade operations accepted since startup
    pub requests: u64,
    /// Facade operations that returned an error
    pub errors: u64,
}

// ============================================================================
// MEMORY ENGINE
// ============================================================================

/// The sectored memory engine
pub struct MemoryEngine {
    pub(crate) store: MetadataStore,
    pub(crate) vectors: VectorStore,
    embedder: Arc<dyn Embedder>,
    fallback: SyntheticEmbedder,
    config: RwLock<Arc<EngineConfig>>,
    /// Per-sector identity vectors driving sector election
    pub(crate) identity: SectorMap<Vec<f32>>,
    /// LRU cache for query embeddings
    query_cache: Mutex<LruCache<String, SectorMap<Vec<f32>>>>,
    inflight_embeds: AtomicUsize,
    requests: AtomicU64,
    errors: AtomicU64,
    requests_flushed: AtomicU64,
}

impl MemoryEngine {
    /// Open an engine over the given database path (platform default when
    /// `None`) with the given embedder and configuration. Runs one decay
    /// pass before returning so queries never see stale salience.
    pub fn new(
        db_path: Option<PathBuf>,
        embedder: Arc<dyn Embedder>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate().map_err(EngineError::Validation)?;
        if embedder.dimensions() != config.vector_dim {
            return Err(EngineError::Validation(format!(
                "embedder yields {} dims, config expects {}",
                embedder.dimensions(),
                config.vector_dim
            )));
        }

        let store = MetadataStore::open(db_path)?;
        let waypoint_rows = store.load_waypoints()?;
        let vectors = VectorStore::with_waypoints(config.vector_dim, waypoint_rows);

        let now = Utc::now();
        for (id, sector, vector, salience) in store.load_index_rows()? {
            if let Err(e) = vectors.upsert(sector, &id, &vector, salience, &config.waypoint, now) {
                tracing::warn!("Failed to load vector for {}: {}", id, e);
            }
        }

        let fallback = SyntheticEmbedder::new(config.vector_dim);
        let identity = Self::build_identity(embedder.as_ref(), &fallback);

        let cache_size = NonZeroUsize::new(config.query_cache_size.max(1))
            .expect("cache size is at least 1");

        let engine = Self {
            store,
            vectors,
            embedder,
            fallback,
            config: RwLock::new(Arc::new(config)),
            identity,
            query_cache: Mutex::new(LruCache::new(cache_size)),
            inflight_embeds: AtomicUsize::new(0),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            requests_flushed: AtomicU64::new(0),
        };

        // Startup sweep: salience is current before the first write
        let report = engine.run_decay()?;
        tracing::info!(
            processed = report.processed,
            decayed = report.decayed,
            purged = report.purged,
            "Startup decay pass complete"
        );

        Ok(engine)
    }

    /// Open with the synthetic embedder and default configuration
    pub fn with_defaults(db_path: Option<PathBuf>) -> Result<Self> {
        let config = EngineConfig::default();
        let embedder = Arc::new(SyntheticEmbedder::new(config.vector_dim));
        Self::new(db_path, embedder, config)
    }

    /// Embed each sector's identity descriptor once; these unit vectors
    /// anchor primary-sector election and multi-sector membership.
    fn build_identity(embedder: &dyn Embedder, fallback: &SyntheticEmbedder) -> SectorMap<Vec<f32>> {
        SectorMap::from_fn(|sector| {
            let text = sector.identity_descriptor();
            match embedder.embed_per_sector(text) {
                Ok(map) => map[sector].clone(),
                Err(e) => {
                    tracing::warn!("Identity embed for {} fell back: {}", sector, e);
                    fallback
                        .embed_per_sector(text)
                        .map(|map| map[sector].clone())
                        .unwrap_or_else(|_| vec![0.0; embedder.dimensions()])
                }
            }
        })
    }

    // ========================================================================
    // CONFIG / TELEMETRY
    // ========================================================================

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<EngineConfig> {
        self.config
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_else(|poisoned| Arc::clone(&poisoned.into_inner()))
    }

    /// Swap in a patched configuration snapshot; readers mid-operation
    /// keep the snapshot they started with.
    pub fn update_config(&self, patch: ConfigPatch) -> Result<Arc<EngineConfig>> {
        let mut guard = self
            .config
            .write()
            .map_err(|_| EngineError::Internal("config latch poisoned".into()))?;
        let next = guard.with_patch(patch);
        next.validate().map_err(EngineError::Validation)?;
        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        Ok(next)
    }

    /// Admission counters since startup
    pub fn counters(&self) -> CountersSnapshot {
        CountersSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Export the logical store state as JSON
    pub fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(self.store.export_snapshot()?)
    }

    pub(crate) fn track<T>(&self, outcome: Result<T>) -> Result<T> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if outcome.is_err() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Flush request counts accumulated since the last flush into the
    /// stats log; called by the decay sweep.
    pub(crate) fn flush_request_stats(&self, now: DateTime<Utc>) {
        let total = self.requests.load(Ordering::Relaxed);
        let flushed = self.requests_flushed.swap(total, Ordering::Relaxed);
        let delta = total.saturating_sub(flushed);
        if delta > 0 {
            if let Err(e) = self.store.log_stat("request", delta as i64, now) {
                tracing::warn!("Could not log request stat: {}", e);
            }
        }
    }

    /// Record a failed background job into the stats log
    pub fn note_job_error(&self, job: &str) {
        if let Err(e) = self.store.log_stat("error", 1, Utc::now()) {
            tracing::warn!("Could not record {} job error: {}", job, e);
        }
    }

    // ========================================================================
    // EMBEDDING
    // ========================================================================

    /// Write-path embedding: backpressure above the high-water mark, then
    /// the configured provider with synthetic fallback. Returns the
    /// vectors and whether the fallback produced them.
    pub(crate) fn embed_for_write(&self, text: &str) -> Result<(SectorMap<Vec<f32>>, bool)> {
        let cfg = self.config();

        let inflight = self.inflight_embeds.fetch_add(1, Ordering::SeqCst);
        if inflight >= cfg.embed_high_water {
            self.inflight_embeds.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::Busy);
        }
        let outcome = self.embedder.embed_per_sector(text);
        self.inflight_embeds.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Ok(map) => {
                self.check_dims(&map, cfg.vector_dim)?;
                Ok((map, false))
            }
            Err(e) => {
                tracing::warn!(provider = self.embedder.name(), "Embed failed, using synthetic fallback: {}", e);
                let map = self
                    .fallback
                    .embed_per_sector(text)
                    .map_err(|e| EngineError::EmbeddingFailed(e.to_string()))?;
                Ok((map, true))
            }
        }
    }

    /// Query-path embedding: cached, no fallback; failures abort the query
    pub(crate) fn embed_for_query(&self, text: &str) -> Result<SectorMap<Vec<f32>>> {
        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some(hit) = cache.get(text) {
                return Ok(hit.clone());
            }
        }

        let map = self.embedder.embed_per_sector(text).map_err(|e| match e {
            crate::embed::EmbedError::Timeout => EngineError::Timeout,
            other => EngineError::EmbeddingFailed(other.to_string()),
        })?;
        self.check_dims(&map, self.config().vector_dim)?;

        if let Ok(mut cache) = self.query_cache.lock() {
            cache.put(text.to_string(), map.clone());
        }
        Ok(map)
    }

    fn check_dims(&self, map: &SectorMap<Vec<f32>>, expected: usize) -> Result<()> {
        for (sector, vector) in map.iter() {
            if vector.len() != expected {
                return Err(EngineError::EmbeddingFailed(format!(
                    "provider returned {} dims for {}, expected {}",
                    vector.len(),
                    sector,
                    expected
                )));
            }
        }
        Ok(())
    }

    // ========================================================================
    // WRITE PATH
    // ========================================================================

    /// Store a new memory
    pub fn add(&self, input: AddInput) -> Result<AddOutcome> {
        let outcome = self.add_at(input, Utc::now());
        self.track(outcome)
    }

    pub(crate) fn add_at(&self, input: AddInput, now: DateTime<Utc>) -> Result<AddOutcome> {
        let cfg = self.config();

        let content = input.content.trim();
        if content.is_empty() {
            return Err(EngineError::Validation("content must not be empty".into()));
        }
        if content.len() > cfg.max_content_bytes {
            return Err(EngineError::Validation(format!(
                "content exceeds {} bytes",
                cfg.max_content_bytes
            )));
        }
        let tags = normalize_tags(&input.tags);

        let (vectors_map, used_fallback) = self.embed_for_write(content)?;
        let fingerprint = simhash(content, cfg.keyword_min_length);
        let kw = keywords(content, cfg.keyword_min_length);

        // Near-duplicate collapse inside the dedup window
        let since = now - chrono::Duration::minutes(cfg.dedup_window_minutes);
        for candidate in self.store.dedup_candidates(input.user_id.as_deref(), since)? {
            let near = (fingerprint != 0
                && crate::index::hamming_distance(candidate.simhash, fingerprint)
                    <= cfg.simhash_hamming_threshold)
                || candidate.content == content;
            if near && candidate.tags == tags {
                self.store.touch_last_seen(&candidate.id, now)?;
                let sectors = self.sectors_of(&candidate)?;
                return Ok(AddOutcome {
                    id: candidate.id,
                    primary_sector: candidate.primary_sector,
                    sectors,
                    chunks: 1,
                    deduplicated: true,
                });
            }
        }

        let (primary, extras) = self.elect_sectors(&vectors_map, &cfg);
        let mut sectors = vec![primary];
        sectors.extend(extras);

        let mut metadata = Metadata::from_extra(input.metadata);
        metadata.fallback_embedding = used_fallback;

        let sector_cfg = cfg.sectors[primary];
        let memory = Memory {
            id: Uuid::now_v7().to_string(),
            user_id: input.user_id,
            content: content.to_string(),
            primary_sector: primary,
            tags,
            metadata,
            simhash: fingerprint,
            salience: cfg.initial_salience,
            decay_lambda: sector_cfg.decay_lambda(),
            created_at: now,
            updated_at: now,
            last_seen_at: now,
            decayed_at: None,
            version: 1,
            tombstoned_at: None,
        };

        let vector_rows: Vec<(Sector, Vec<f32>)> = sectors
            .iter()
            .map(|s| (*s, vectors_map[*s].clone()))
            .collect();
        self.persist_memory(&memory, &vector_rows, &kw, now)?;

        Ok(AddOutcome {
            id: memory.id,
            primary_sector: primary,
            sectors,
            chunks: 1,
            deduplicated: false,
        })
    }

    /// Insert a memory row, its vectors and keywords transactionally, then
    /// mirror the vectors into the in-memory indexes. A query racing this
    /// sees either nothing or the fully committed memory.
    pub(crate) fn persist_memory(
        &self,
        memory: &Memory,
        vector_rows: &[(Sector, Vec<f32>)],
        kw: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let cfg = self.config();
        self.store.insert_memory(memory, vector_rows, kw)?;
        for (sector, vector) in vector_rows {
            if let Err(e) = self.vectors.upsert(
                *sector,
                &memory.id,
                vector,
                memory.salience,
                &cfg.waypoint,
                now,
            ) {
                tracing::warn!("Index upsert failed for {} in {}: {}", memory.id, sector, e);
            }
        }
        Ok(())
    }

    /// Elect the primary sector and any additional sectors a memory
    /// belongs to, by cosine against the sector identity vectors.
    fn elect_sectors(
        &self,
        vectors_map: &SectorMap<Vec<f32>>,
        cfg: &EngineConfig,
    ) -> (Sector, Vec<Sector>) {
        let affinity =
            SectorMap::from_fn(|s| cosine_similarity(&vectors_map[s], &self.identity[s]));

        let primary = if self.embedder.is_per_sector() {
            Sector::ALL
                .into_iter()
                .max_by(|a, b| {
                    affinity[*a]
                        .partial_cmp(&affinity[*b])
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or(Sector::Semantic)
        } else {
            Sector::Semantic
        };

        let mut extras: Vec<(Sector, f32)> = Sector::ALL
            .into_iter()
            .filter(|s| *s != primary && affinity[*s] >= cfg.multi_sector_threshold)
            .map(|s| (s, affinity[s]))
            .collect();
        extras.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.index().cmp(&b.0.index()))
        });
        extras.truncate(cfg.multi_sector_cap);

        (primary, extras.into_iter().map(|(s, _)| s).collect())
    }

    /// Sectors a stored memory is filed under, primary first
    pub(crate) fn sectors_of(&self, memory: &Memory) -> Result<Vec<Sector>> {
        let mut sectors: Vec<Sector> = self
            .store
            .vectors_for(&memory.id)?
            .into_iter()
            .map(|(sector, _)| sector)
            .collect();
        sectors.sort_by_key(|s| {
            if *s == memory.primary_sector {
                0
            } else {
                s.index() + 1
            }
        });
        if sectors.is_empty() {
            sectors.push(memory.primary_sector);
        }
        Ok(sectors)
    }

    // ========================================================================
    // READ PATH
    // ========================================================================

    /// Fetch one memory; a user filter mismatch reads as not-found
    pub fn get(&self, id: &str, user_id: Option<&str>) -> Result<Memory> {
        let outcome = self.get_inner(id, user_id);
        self.track(outcome)
    }

    fn get_inner(&self, id: &str, user_id: Option<&str>) -> Result<Memory> {
        let memory = self
            .store
            .get_memory(id)?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if memory.is_tombstoned() {
            return Err(EngineError::NotFound(id.to_string()));
        }
        if let Some(user) = user_id {
            if memory.user_id.as_deref() != Some(user) {
                return Err(EngineError::NotFound(id.to_string()));
            }
        }
        Ok(memory)
    }

    /// List live memories matching the filter, newest first
    pub fn list(&self, filter: &ListFilter, limit: usize, offset: usize) -> Result<Vec<Memory>> {
        let limit = limit.clamp(1, 500);
        let outcome = self
            .store
            .list_memories(filter, limit, offset)
            .map_err(EngineError::from);
        self.track(outcome)
    }

    /// Delete a memory and its vectors; edges and waypoint members are
    /// cleaned lazily at the next maintenance pass.
    pub fn delete(&self, id: &str) -> Result<()> {
        let outcome = self.delete_inner(id);
        self.track(outcome)
    }

    fn delete_inner(&self, id: &str) -> Result<()> {
        if !self.store.delete_memory(id)? {
            return Err(EngineError::NotFound(id.to_string()));
        }
        if let Err(e) = self.vectors.delete(id) {
            tracing::warn!("Index delete failed for {}: {}", id, e);
        }
        Ok(())
    }
}

/// Trim, drop empties, deduplicate preserving first occurrence
fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for tag in tags {
        let trimmed = tag.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            out.push(trimmed.to_string());
        }
    }
    out
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_engine() -> (TempDir, MemoryEngine) {
        let dir = TempDir::new().unwrap();
        let engine = MemoryEngine::with_defaults(Some(dir.path().join("engine.db"))).unwrap();
        (dir, engine)
    }

    #[test]
    fn test_add_then_get_roundtrip() {
        let (_dir, engine) = open_engine();

        let outcome = engine.add(AddInput::new("The quick brown fox")).unwrap();
        assert_eq!(outcome.primary_sector, Sector::Semantic);
        assert_eq!(outcome.chunks, 1);
        assert!(!outcome.deduplicated);

        let memory = engine.get(&outcome.id, None).unwrap();
        assert_eq!(memory.content, "The quick brown fox");
        assert!((memory.salience - 0.5).abs() < 1e-6);

        // Sectors reported by add match what get's row is filed under
        let sectors = engine.sectors_of(&memory).unwrap();
        assert_eq!(sectors, outcome.sectors);
    }

    #[test]
    fn test_add_validation() {
        let (_dir, engine) = open_engine();

        let err = engine.add(AddInput::new("   ")).unwrap_err();
        assert_eq!(err.code(), "validation");

        let huge = "x".repeat(engine.config().max_content_bytes + 1);
        let err = engine.add(AddInput::new(huge)).unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn test_dedup_within_window() {
        let (_dir, engine) = open_engine();

        let first = engine
            .add(AddInput::new("Meeting with Alice at 3pm"))
            .unwrap();
        let second = engine
            .add(AddInput::new("Meeting with Alice at 3pm"))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert!(second.deduplicated);

        let listed = engine.list(&ListFilter::default(), 10, 0).unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn test_dedup_respects_tags() {
        let (_dir, engine) = open_engine();

        let mut tagged = AddInput::new("Meeting with Alice at 3pm");
        tagged.tags = vec!["work".to_string()];

        let first = engine.add(AddInput::new("Meeting with Alice at 3pm")).unwrap();
        let second = engine.add(tagged).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_get_user_mismatch_is_not_found() {
        let (_dir, engine) = open_engine();

        let mut input = AddInput::new("private note");
        input.user_id = Some("u-1".to_string());
        let outcome = engine.add(input).unwrap();

        assert!(engine.get(&outcome.id, Some("u-1")).is_ok());
        let err = engine.get(&outcome.id, Some("u-2")).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn test_delete_then_get_not_found() {
        let (_dir, engine) = open_engine();

        let outcome = engine.add(AddInput::new("soon gone")).unwrap();
        engine.delete(&outcome.id).unwrap();

        assert_eq!(engine.get(&outcome.id, None).unwrap_err().code(), "not_found");
        assert_eq!(engine.delete(&outcome.id).unwrap_err().code(), "not_found");
    }

    #[test]
    fn test_counters_track_requests_and_errors() {
        let (_dir, engine) = open_engine();

        engine.add(AddInput::new("fine")).unwrap();
        let _ = engine.get("missing", None);

        let counters = engine.counters();
        assert_eq!(counters.requests, 2);
        assert_eq!(counters.errors, 1);
    }

    #[test]
    fn test_update_config_swaps_snapshot() {
        let (_dir, engine) = open_engine();

        let before = engine.config();
        engine
            .update_config(ConfigPatch {
                simhash_hamming_threshold: Some(7),
                ..Default::default()
            })
            .unwrap();
        let after = engine.config();

        assert_eq!(before.simhash_hamming_threshold, 3);
        assert_eq!(after.simhash_hamming_threshold, 7);
    }

    #[test]
    fn test_normalize_tags() {
        let tags = vec![
            "  work ".to_string(),
            "".to_string(),
            "work".to_string(),
            "home".to_string(),
        ];
        assert_eq!(normalize_tags(&tags), vec!["work", "home"]);
    }

    #[test]
    fn test_per_sector_embedder_elects_nontrivial_primary() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::default();
        let embedder = Arc::new(SyntheticEmbedder::per_sector(config.vector_dim));
        let engine =
            MemoryEngine::new(Some(dir.path().join("adv.db")), embedder, config).unwrap();

        // Election is deterministic and picks some sector
        let outcome = engine
            .add(AddInput::new("how to roll sushi step by step"))
            .unwrap();
        let again = engine.get(&outcome.id, None).unwrap();
        assert_eq!(again.primary_sector, outcome.primary_sector);
    }
}
