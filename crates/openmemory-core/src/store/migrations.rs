//! Database migrations
//!
//! Schema migration definitions for the metadata store.

use rusqlite::Connection;

use super::{Result, StoreError};

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "Initial schema: memories, vectors, waypoints, edges, keywords, stats, users",
    up: MIGRATION_V1_UP,
}];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Initial schema
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    user_id TEXT,
    content TEXT NOT NULL,
    primary_sector TEXT NOT NULL DEFAULT 'semantic',
    tags TEXT NOT NULL DEFAULT '[]',
    meta TEXT NOT NULL DEFAULT '{}',
    simhash INTEGER NOT NULL DEFAULT 0,
    salience REAL NOT NULL DEFAULT 0.5,
    decay_lambda REAL NOT NULL DEFAULT 0.0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    decayed_at TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    tombstoned_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_memories_user ON memories(user_id);
CREATE INDEX IF NOT EXISTS idx_memories_sector ON memories(primary_sector);
CREATE INDEX IF NOT EXISTS idx_memories_last_seen ON memories(last_seen_at);
CREATE INDEX IF NOT EXISTS idx_memories_tombstone ON memories(tombstoned_at);

-- Per-sector embedding vectors (D x f32, little-endian)
CREATE TABLE IF NOT EXISTS vectors (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    sector TEXT NOT NULL,
    v BLOB NOT NULL,
    PRIMARY KEY (memory_id, sector)
);

-- Coarse centroids restricting ANN scans; members rebuilt at load
CREATE TABLE IF NOT EXISTS waypoints (
    id TEXT PRIMARY KEY,
    sector TEXT NOT NULL,
    centroid BLOB NOT NULL,
    member_count INTEGER NOT NULL DEFAULT 0,
    strength REAL NOT NULL DEFAULT 0.0,
    last_updated TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_waypoints_sector ON waypoints(sector);

-- Associative graph; weak references, cleaned lazily
CREATE TABLE IF NOT EXISTS edges (
    src_id TEXT NOT NULL,
    dst_id TEXT NOT NULL,
    relation TEXT NOT NULL DEFAULT 'associative',
    weight REAL NOT NULL DEFAULT 0.0,
    last_updated TEXT NOT NULL,
    PRIMARY KEY (src_id, dst_id, relation)
);

CREATE INDEX IF NOT EXISTS idx_edges_src ON edges(src_id);

-- Inverted keyword index, bounded per keyword during maintenance
CREATE TABLE IF NOT EXISTS keywords (
    keyword TEXT NOT NULL,
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    PRIMARY KEY (keyword, memory_id)
);

CREATE INDEX IF NOT EXISTS idx_keywords_memory ON keywords(memory_id);

-- Append-only maintenance and request log
CREATE TABLE IF NOT EXISTS stats (
    type TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    ts TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    summary TEXT,
    summary_updated_at TEXT
);

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// Apply all pending migrations on the writer connection
pub fn apply_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for migration in MIGRATIONS {
        if migration.version > current {
            conn.execute_batch(migration.up).map_err(|e| {
                StoreError::Init(format!(
                    "migration v{} ({}) failed: {}",
                    migration.version, migration.description, e
                ))
            })?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
                rusqlite::params![migration.version],
            )?;
        }
    }

    Ok(())
}
