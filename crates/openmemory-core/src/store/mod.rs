//! Metadata store
//!
//! Durable SQLite tables for memories, per-sector vectors, waypoints,
//! associative edges, the keyword inverted index, the stats log, and user
//! records. Single-writer-many-reader: one writer connection behind a
//! mutex serializes all multi-row transactions; reads go to a second
//! connection on the same file.

mod migrations;
mod sqlite;

pub use migrations::{apply_migrations, Migration, MIGRATIONS};
pub use sqlite::{
    DecayUpdate, EdgeRow, MetadataStore, Result, StatRow, StoreError, UserRow,
};
