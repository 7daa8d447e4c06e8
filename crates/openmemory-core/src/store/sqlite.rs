//! SQLite storage implementation
//!
//! Writer/reader connection pair with WAL journaling. All multi-row writes
//! run in transactions on the writer; prepared statements are per-call.
//! Timestamps are RFC3339 TEXT; vectors are little-endian f32 BLOBs; the
//! u64 simhash is stored bit-cast as i64.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::embed::{vec_from_bytes, vec_to_bytes};
use crate::memory::{ListFilter, Memory, Metadata, Sector, SectorMap};
use crate::vector::WaypointRow;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Storage error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
    /// A stored row failed to parse
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StoreError>;

// ============================================================================
// ROW TYPES
// ============================================================================

/// A stored associative edge
#[derive(Debug, Clone)]
pub struct EdgeRow {
    /// Source memory id
    pub src_id: String,
    /// Target memory id
    pub dst_id: String,
    /// Relation tag (default `associative`)
    pub relation: String,
    /// Weight in [0, 1]
    pub weight: f32,
    /// Last update
    pub last_updated: DateTime<Utc>,
}

/// One stats log entry
#[derive(Debug, Clone)]
pub struct StatRow {
    /// Entry type (`request`, `error`, `decay`, `reflect`, ...)
    pub stat_type: String,
    /// Count the job or tracker reported
    pub count: i64,
    /// Timestamp
    pub ts: DateTime<Utc>,
}

/// A user record
#[derive(Debug, Clone)]
pub struct UserRow {
    /// User id
    pub id: String,
    /// First time a memory was stored for the user
    pub created_at: DateTime<Utc>,
    /// Derived summary, never authoritative
    pub summary: Option<String>,
    /// When the summary was last rebuilt
    pub summary_updated_at: Option<DateTime<Utc>>,
}

/// One memory's outcome in a decay sweep
#[derive(Debug, Clone)]
pub struct DecayUpdate {
    /// Memory id
    pub id: String,
    /// Salience after decay (already floored)
    pub salience: f32,
    /// Whether this sweep soft-deletes the memory
    pub tombstone: bool,
}

// ============================================================================
// METADATA STORE
// ============================================================================

const MEMORY_COLUMNS: &str = "id, user_id, content, primary_sector, tags, meta, simhash, \
     salience, decay_lambda, created_at, updated_at, last_seen_at, decayed_at, version, \
     tombstoned_at";

/// Durable key/value tables behind a writer/reader connection pair
///
/// All methods take `&self`; the store is `Send + Sync` so the engine can
/// live behind an `Arc` without an outer mutex.
pub struct MetadataStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl MetadataStore {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (or create) the store at the given path, or the platform
    /// default data directory when none is given.
    pub fn open(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = ProjectDirs::from("io", "openmemory", "core").ok_or_else(|| {
                    StoreError::Init("Could not determine project directories".to_string())
                })?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                data_dir.join("openmemory.db")
            }
        };

        let writer_conn = Connection::open(&path)?;
        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
        })
    }

    fn writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StoreError::Init("Writer lock poisoned".into()))
    }

    fn reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| StoreError::Init("Reader lock poisoned".into()))
    }

    // ========================================================================
    // ROW MAPPING
    // ========================================================================

    /// Parse RFC3339 timestamp
    fn parse_timestamp(value: &str, field_name: &str) -> rusqlite::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("Invalid {} timestamp '{}': {}", field_name, value, e),
                    )),
                )
            })
    }

    fn parse_sector(value: &str) -> rusqlite::Result<Sector> {
        Sector::parse_name(value).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Unknown sector '{}'", value),
                )),
            )
        })
    }

    fn opt_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
        value.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        })
    }

    /// Convert a row to Memory
    fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
        let tags_json: String = row.get("tags")?;
        let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();

        let meta_json: String = row.get("meta")?;
        let sector_str: String = row.get("primary_sector")?;

        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;
        let last_seen_at: String = row.get("last_seen_at")?;
        let decayed_at: Option<String> = row.get("decayed_at")?;
        let tombstoned_at: Option<String> = row.get("tombstoned_at")?;

        Ok(Memory {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            content: row.get("content")?,
            primary_sector: Self::parse_sector(&sector_str)?,
            tags,
            metadata: Metadata::from_json(&meta_json),
            simhash: row.get::<_, i64>("simhash")? as u64,
            salience: row.get("salience")?,
            decay_lambda: row.get("decay_lambda")?,
            created_at: Self::parse_timestamp(&created_at, "created_at")?,
            updated_at: Self::parse_timestamp(&updated_at, "updated_at")?,
            last_seen_at: Self::parse_timestamp(&last_seen_at, "last_seen_at")?,
            decayed_at: Self::opt_timestamp(decayed_at),
            version: row.get("version")?,
            tombstoned_at: Self::opt_timestamp(tombstoned_at),
        })
    }

    // ========================================================================
    // MEMORIES
    // ========================================================================

    /// Insert a memory with its sector vectors and keywords in one
    /// transaction, creating the user row on first sight.
    pub fn insert_memory(
        &self,
        memory: &Memory,
        vectors: &[(Sector, Vec<f32>)],
        keywords: &BTreeSet<String>,
    ) -> Result<()> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        if let Some(user_id) = &memory.user_id {
            tx.execute(
                "INSERT OR IGNORE INTO users (id, created_at) VALUES (?1, ?2)",
                params![user_id, memory.created_at.to_rfc3339()],
            )?;
        }

        tx.execute(
            "INSERT INTO memories (
                id, user_id, content, primary_sector, tags, meta, simhash,
                salience, decay_lambda, created_at, updated_at, last_seen_at,
                decayed_at, version, tombstoned_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                memory.id,
                memory.user_id,
                memory.content,
                memory.primary_sector.as_str(),
                serde_json::to_string(&memory.tags).unwrap_or_else(|_| "[]".to_string()),
                memory.metadata.to_json(),
                memory.simhash as i64,
                memory.salience,
                memory.decay_lambda,
                memory.created_at.to_rfc3339(),
                memory.updated_at.to_rfc3339(),
                memory.last_seen_at.to_rfc3339(),
                memory.decayed_at.map(|t| t.to_rfc3339()),
                memory.version,
                memory.tombstoned_at.map(|t| t.to_rfc3339()),
            ],
        )?;

        for (sector, vector) in vectors {
            tx.execute(
                "INSERT OR REPLACE INTO vectors (memory_id, sector, v) VALUES (?1, ?2, ?3)",
                params![memory.id, sector.as_str(), vec_to_bytes(vector)],
            )?;
        }

        for keyword in keywords {
            tx.execute(
                "INSERT OR IGNORE INTO keywords (keyword, memory_id) VALUES (?1, ?2)",
                params![keyword, memory.id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Fetch one memory by id
    pub fn get_memory(&self, id: &str) -> Result<Option<Memory>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM memories WHERE id = ?1",
            MEMORY_COLUMNS
        ))?;
        let memory = stmt
            .query_row(params![id], Self::row_to_memory)
            .optional()?;
        Ok(memory)
    }

    /// Bulk fetch by ids; missing ids are skipped
    pub fn get_memories(&self, ids: &[&str]) -> Result<Vec<Memory>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM memories WHERE id IN ({})",
            MEMORY_COLUMNS, placeholders
        ))?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), Self::row_to_memory)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// List live memories matching the filter, newest first
    pub fn list_memories(
        &self,
        filter: &ListFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Memory>> {
        use rusqlite::types::Value;

        let mut sql = format!(
            "SELECT {} FROM memories WHERE tombstoned_at IS NULL",
            MEMORY_COLUMNS
        );
        let mut args: Vec<Value> = Vec::new();

        if let Some(user_id) = &filter.user_id {
            sql.push_str(" AND user_id = ?");
            args.push(Value::from(user_id.clone()));
        }
        if let Some(sector) = filter.sector {
            sql.push_str(" AND primary_sector = ?");
            args.push(Value::from(sector.as_str().to_string()));
        }
        if let Some(min_salience) = filter.min_salience {
            sql.push_str(" AND salience >= ?");
            args.push(Value::from(min_salience as f64));
        }
        if let Some(tags) = &filter.tags {
            for tag in tags {
                sql.push_str(" AND tags LIKE ?");
                args.push(Value::from(format!("%\"{}\"%", tag)));
            }
        }

        sql.push_str(" ORDER BY created_at DESC, id ASC LIMIT ? OFFSET ?");
        args.push(Value::from(limit as i64));
        args.push(Value::from(offset as i64));

        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), Self::row_to_memory)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Live memories of one user (or the anonymous pool) seen inside the
    /// dedup window, for near-duplicate collapsing.
    pub fn dedup_candidates(
        &self,
        user_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<Memory>> {
        let reader = self.reader()?;
        let (clause, user) = match user_id {
            Some(u) => ("user_id = ?2", u.to_string()),
            None => ("user_id IS NULL AND ?2 = ?2", String::new()),
        };
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM memories
             WHERE tombstoned_at IS NULL AND last_seen_at >= ?1 AND {}",
            MEMORY_COLUMNS, clause
        ))?;
        let rows = stmt.query_map(params![since.to_rfc3339(), user], Self::row_to_memory)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Most recent live memories, for reflection scans
    pub fn recent_memories(&self, limit: usize) -> Result<Vec<Memory>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM memories WHERE tombstoned_at IS NULL
             ORDER BY created_at DESC, id ASC LIMIT ?1",
            MEMORY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64], Self::row_to_memory)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Every live memory, for decay sweeps
    pub fn active_memories(&self) -> Result<Vec<Memory>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM memories WHERE tombstoned_at IS NULL ORDER BY id ASC",
            MEMORY_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::row_to_memory)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Refresh `last_seen_at` (dedup hits, retrieval side effects)
    pub fn touch_last_seen(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let writer = self.writer()?;
        let changed = writer.execute(
            "UPDATE memories SET last_seen_at = ?1, updated_at = ?1, version = version + 1
             WHERE id = ?2 AND tombstoned_at IS NULL",
            params![now.to_rfc3339(), id],
        )?;
        Ok(changed > 0)
    }

    /// Versioned salience update. Returns false when the version moved
    /// under us (caller retries once, then surfaces Conflict).
    pub fn update_salience(
        &self,
        id: &str,
        expected_version: u32,
        salience: f32,
        touch_seen: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let writer = self.writer()?;
        let changed = writer.execute(
            "UPDATE memories SET
                salience = ?1,
                updated_at = ?2,
                last_seen_at = CASE WHEN ?3 THEN ?2 ELSE last_seen_at END,
                version = version + 1
             WHERE id = ?4 AND version = ?5 AND tombstoned_at IS NULL",
            params![salience, now.to_rfc3339(), touch_seen, id, expected_version],
        )?;
        Ok(changed > 0)
    }

    /// Overwrite metadata and salience together (reflection marking)
    pub fn update_meta_and_salience(
        &self,
        id: &str,
        metadata: &Metadata,
        salience: f32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let writer = self.writer()?;
        let changed = writer.execute(
            "UPDATE memories SET
                meta = ?1, salience = ?2, updated_at = ?3, last_seen_at = ?3,
                version = version + 1
             WHERE id = ?4 AND tombstoned_at IS NULL",
            params![metadata.to_json(), salience, now.to_rfc3339(), id],
        )?;
        Ok(changed > 0)
    }

    /// Apply a decay sweep's outcomes in one transaction
    pub fn apply_decay_updates(&self, updates: &[DecayUpdate], now: DateTime<Utc>) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        let ts = now.to_rfc3339();

        for update in updates {
            if update.tombstone {
                tx.execute(
                    "UPDATE memories SET
                        salience = ?1, decayed_at = ?2, tombstoned_at = ?2,
                        updated_at = ?2, version = version + 1
                     WHERE id = ?3 AND tombstoned_at IS NULL",
                    params![update.salience, ts, update.id],
                )?;
                // Tombstoned memories leave the keyword index right away
                tx.execute(
                    "DELETE FROM keywords WHERE memory_id = ?1",
                    params![update.id],
                )?;
            } else {
                tx.execute(
                    "UPDATE memories SET
                        salience = ?1, decayed_at = ?2, updated_at = ?2,
                        version = version + 1
                     WHERE id = ?3 AND tombstoned_at IS NULL",
                    params![update.salience, ts, update.id],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Purge tombstones from earlier sweeps; cascades vectors and keywords
    pub fn purge_tombstoned_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let writer = self.writer()?;
        let purged = writer.execute(
            "DELETE FROM memories WHERE tombstoned_at IS NOT NULL AND tombstoned_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(purged as u64)
    }

    /// Hard-delete one memory; cascades vectors and keywords
    pub fn delete_memory(&self, id: &str) -> Result<bool> {
        let writer = self.writer()?;
        let deleted = writer.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    /// Count of live memories
    pub fn count_active(&self) -> Result<u64> {
        let reader = self.reader()?;
        let count: i64 = reader.query_row(
            "SELECT COUNT(*) FROM memories WHERE tombstoned_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ========================================================================
    // VECTORS
    // ========================================================================

    /// Load every live vector with its salience hint, for index rebuild
    pub fn load_index_rows(&self) -> Result<Vec<(String, Sector, Vec<f32>, f32)>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT v.memory_id, v.sector, v.v, m.salience
             FROM vectors v JOIN memories m ON m.id = v.memory_id
             WHERE m.tombstoned_at IS NULL
             ORDER BY v.memory_id, v.sector",
        )?;

        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let sector_str: String = row.get(1)?;
            let blob: Vec<u8> = row.get(2)?;
            let salience: f32 = row.get(3)?;
            Ok((id, sector_str, blob, salience))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, sector_str, blob, salience) = row?;
            let sector = Sector::parse_name(&sector_str)
                .ok_or_else(|| StoreError::Corrupt(format!("Unknown sector '{}'", sector_str)))?;
            let vector = vec_from_bytes(&blob)
                .ok_or_else(|| StoreError::Corrupt(format!("Bad vector blob for {}", id)))?;
            out.push((id, sector, vector, salience));
        }
        Ok(out)
    }

    /// Sector vectors of one memory
    pub fn vectors_for(&self, id: &str) -> Result<Vec<(Sector, Vec<f32>)>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT sector, v FROM vectors WHERE memory_id = ?1 ORDER BY sector",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            let sector_str: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((sector_str, blob))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (sector_str, blob) = row?;
            let sector = Sector::parse_name(&sector_str)
                .ok_or_else(|| StoreError::Corrupt(format!("Unknown sector '{}'", sector_str)))?;
            let vector = vec_from_bytes(&blob)
                .ok_or_else(|| StoreError::Corrupt(format!("Bad vector blob for {}", id)))?;
            out.push((sector, vector));
        }
        Ok(out)
    }

    // ========================================================================
    // KEYWORDS
    // ========================================================================

    /// Keyword sets of the given memories
    pub fn keywords_for_ids(&self, ids: &[&str]) -> Result<HashMap<String, BTreeSet<String>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT memory_id, keyword FROM keywords WHERE memory_id IN ({})",
            placeholders
        ))?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out: HashMap<String, BTreeSet<String>> = HashMap::new();
        for row in rows {
            let (id, keyword) = row?;
            out.entry(id).or_default().insert(keyword);
        }
        Ok(out)
    }

    /// Trim each keyword's postings to the most-salient `cap` memories
    pub fn trim_keyword_index(&self, cap: usize) -> Result<u64> {
        let writer = self.writer()?;
        let trimmed = writer.execute(
            "DELETE FROM keywords WHERE (keyword, memory_id) IN (
                SELECT keyword, memory_id FROM (
                    SELECT k.keyword, k.memory_id,
                           ROW_NUMBER() OVER (
                               PARTITION BY k.keyword
                               ORDER BY m.salience DESC, k.memory_id ASC
                           ) AS rn
                    FROM keywords k JOIN memories m ON m.id = k.memory_id
                ) WHERE rn > ?1
            )",
            params![cap as i64],
        )?;
        Ok(trimmed as u64)
    }

    // ========================================================================
    // EDGES
    // ========================================================================

    /// Create or bump one edge; weight clamps to [0, 1], self-edges are
    /// rejected upstream.
    pub fn bump_edge(
        &self,
        src_id: &str,
        dst_id: &str,
        relation: &str,
        delta: f32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO edges (src_id, dst_id, relation, weight, last_updated)
             VALUES (?1, ?2, ?3, MIN(1.0, MAX(0.0, ?4)), ?5)
             ON CONFLICT(src_id, dst_id, relation)
             DO UPDATE SET weight = MIN(1.0, MAX(0.0, weight + ?4)), last_updated = ?5",
            params![src_id, dst_id, relation, delta, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Bump a batch of edges in one transaction
    pub fn bump_edges(
        &self,
        pairs: &[(String, String)],
        relation: &str,
        delta: f32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        let ts = now.to_rfc3339();
        for (src, dst) in pairs {
            if src == dst {
                continue;
            }
            tx.execute(
                "INSERT INTO edges (src_id, dst_id, relation, weight, last_updated)
                 VALUES (?1, ?2, ?3, MIN(1.0, MAX(0.0, ?4)), ?5)
                 ON CONFLICT(src_id, dst_id, relation)
                 DO UPDATE SET weight = MIN(1.0, MAX(0.0, weight + ?4)), last_updated = ?5",
                params![src, dst, relation, delta, ts],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Outgoing edges of a memory, ordered for deterministic walks
    pub fn edges_from(&self, src_id: &str) -> Result<Vec<EdgeRow>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT src_id, dst_id, relation, weight, last_updated
             FROM edges WHERE src_id = ?1 ORDER BY dst_id ASC, relation ASC",
        )?;
        let rows = stmt.query_map(params![src_id], |row| {
            let ts: String = row.get(4)?;
            Ok(EdgeRow {
                src_id: row.get(0)?,
                dst_id: row.get(1)?,
                relation: row.get(2)?,
                weight: row.get(3)?,
                last_updated: Self::parse_timestamp(&ts, "last_updated")?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Decay every edge by its own elapsed time and drop the ones that
    /// fall below the prune threshold or dangle. Returns edges pruned.
    pub fn decay_and_prune_edges(
        &self,
        half_life_hours: f32,
        prune_threshold: f32,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        let mut pruned = 0_u64;
        {
            let mut stmt = tx.prepare(
                "SELECT src_id, dst_id, relation, weight, last_updated FROM edges",
            )?;
            let rows = stmt.query_map([], |row| {
                let ts: String = row.get(4)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f32>(3)?,
                    Self::parse_timestamp(&ts, "last_updated")?,
                ))
            })?;

            let mut updates: Vec<(String, String, String, f32)> = Vec::new();
            let mut deletions: Vec<(String, String, String)> = Vec::new();
            for row in rows {
                let (src, dst, relation, weight, last_updated) = row?;
                let dt_hours = (now - last_updated).num_seconds().max(0) as f32 / 3600.0;
                let decayed =
                    weight * (-std::f32::consts::LN_2 * dt_hours / half_life_hours).exp();
                if decayed < prune_threshold {
                    deletions.push((src, dst, relation));
                } else if dt_hours > 0.0 {
                    updates.push((src, dst, relation, decayed));
                }
            }
            drop(stmt);

            let ts = now.to_rfc3339();
            for (src, dst, relation, weight) in updates {
                tx.execute(
                    "UPDATE edges SET weight = ?1, last_updated = ?2
                     WHERE src_id = ?3 AND dst_id = ?4 AND relation = ?5",
                    params![weight, ts, src, dst, relation],
                )?;
            }
            for (src, dst, relation) in deletions {
                tx.execute(
                    "DELETE FROM edges WHERE src_id = ?1 AND dst_id = ?2 AND relation = ?3",
                    params![src, dst, relation],
                )?;
                pruned += 1;
            }
        }

        // Lazy cleanup of edges pointing at deleted memories
        pruned += tx.execute(
            "DELETE FROM edges WHERE
                src_id NOT IN (SELECT id FROM memories)
                OR dst_id NOT IN (SELECT id FROM memories)",
            [],
        )? as u64;

        tx.commit()?;
        Ok(pruned)
    }

    // ========================================================================
    // WAYPOINTS
    // ========================================================================

    /// Replace one sector's persisted waypoint rows
    pub fn replace_waypoints(&self, sector: Sector, rows: &[WaypointRow]) -> Result<()> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        tx.execute(
            "DELETE FROM waypoints WHERE sector = ?1",
            params![sector.as_str()],
        )?;
        for row in rows {
            tx.execute(
                "INSERT INTO waypoints (id, sector, centroid, member_count, strength, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.id,
                    sector.as_str(),
                    vec_to_bytes(&row.centroid),
                    row.member_count as i64,
                    row.strength,
                    row.last_updated.to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Load every sector's persisted waypoint rows
    pub fn load_waypoints(&self) -> Result<SectorMap<Vec<WaypointRow>>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, sector, centroid, member_count, strength, last_updated
             FROM waypoints ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let ts: String = row.get(5)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, f32>(4)?,
                Self::parse_timestamp(&ts, "last_updated")?,
            ))
        })?;

        let mut out: SectorMap<Vec<WaypointRow>> = SectorMap::default();
        for row in rows {
            let (id, sector_str, blob, member_count, strength, last_updated) = row?;
            let sector = Sector::parse_name(&sector_str)
                .ok_or_else(|| StoreError::Corrupt(format!("Unknown sector '{}'", sector_str)))?;
            let centroid = vec_from_bytes(&blob)
                .ok_or_else(|| StoreError::Corrupt(format!("Bad centroid blob for {}", id)))?;
            out[sector].push(WaypointRow {
                id,
                centroid,
                member_count: member_count as usize,
                strength,
                last_updated,
            });
        }
        Ok(out)
    }

    // ========================================================================
    // STATS
    // ========================================================================

    /// Append one stats entry
    pub fn log_stat(&self, stat_type: &str, count: i64, ts: DateTime<Utc>) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO stats (type, count, ts) VALUES (?1, ?2, ?3)",
            params![stat_type, count, ts.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Latest stats entries, newest first
    pub fn recent_stats(&self, limit: usize) -> Result<Vec<StatRow>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT type, count, ts FROM stats ORDER BY ts DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let ts: String = row.get(2)?;
            Ok(StatRow {
                stat_type: row.get(0)?,
                count: row.get(1)?,
                ts: Self::parse_timestamp(&ts, "ts")?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ========================================================================
    // USERS
    // ========================================================================

    /// Fetch a user record
    pub fn get_user(&self, id: &str) -> Result<Option<UserRow>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, created_at, summary, summary_updated_at FROM users WHERE id = ?1",
        )?;
        let user = stmt
            .query_row(params![id], |row| {
                let created: String = row.get(1)?;
                let summary_updated: Option<String> = row.get(3)?;
                Ok(UserRow {
                    id: row.get(0)?,
                    created_at: Self::parse_timestamp(&created, "created_at")?,
                    summary: row.get(2)?,
                    summary_updated_at: Self::opt_timestamp(summary_updated),
                })
            })
            .optional()?;
        Ok(user)
    }

    /// All user ids
    pub fn user_ids(&self) -> Result<Vec<String>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare("SELECT id FROM users ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Store a rebuilt user summary
    pub fn update_user_summary(
        &self,
        id: &str,
        summary: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let writer = self.writer()?;
        let changed = writer.execute(
            "UPDATE users SET summary = ?1, summary_updated_at = ?2 WHERE id = ?3",
            params![summary, now.to_rfc3339(), id],
        )?;
        Ok(changed > 0)
    }

    /// A user's strongest live memories, for summary rebuilds
    pub fn top_memories_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<Memory>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM memories
             WHERE tombstoned_at IS NULL AND user_id = ?1
             ORDER BY salience DESC, id ASC LIMIT ?2",
            MEMORY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id, limit as i64], Self::row_to_memory)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ========================================================================
    // SNAPSHOT
    // ========================================================================

    /// Export the logical state as JSON (vector blobs are summarized by
    /// count; they are bulk data, not metadata).
    pub fn export_snapshot(&self) -> Result<serde_json::Value> {
        let memories = self.active_memories()?;
        let users = {
            let ids = self.user_ids()?;
            let mut out = Vec::new();
            for id in ids {
                if let Some(user) = self.get_user(&id)? {
                    out.push(serde_json::json!({
                        "id": user.id,
                        "createdAt": user.created_at.to_rfc3339(),
                        "summary": user.summary,
                    }));
                }
            }
            out
        };

        let reader = self.reader()?;
        let vector_count: i64 =
            reader.query_row("SELECT COUNT(*) FROM vectors", [], |row| row.get(0))?;
        let edge_count: i64 =
            reader.query_row("SELECT COUNT(*) FROM edges", [], |row| row.get(0))?;
        let waypoint_count: i64 =
            reader.query_row("SELECT COUNT(*) FROM waypoints", [], |row| row.get(0))?;
        drop(reader);

        let mut edges = Vec::new();
        {
            let reader = self.reader()?;
            let mut stmt = reader.prepare(
                "SELECT src_id, dst_id, relation, weight FROM edges ORDER BY src_id, dst_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(serde_json::json!({
                    "src": row.get::<_, String>(0)?,
                    "dst": row.get::<_, String>(1)?,
                    "relation": row.get::<_, String>(2)?,
                    "weight": row.get::<_, f32>(3)?,
                }))
            })?;
            for row in rows {
                edges.push(row?);
            }
        }

        Ok(serde_json::json!({
            "memories": memories,
            "edges": edges,
            "users": users,
            "counts": {
                "vectors": vector_count,
                "edges": edge_count,
                "waypoints": waypoint_count,
            },
        }))
    }
}

// ============================================================================
// TESTS
// ============================================================================
