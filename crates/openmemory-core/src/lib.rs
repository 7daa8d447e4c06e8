//! # OpenMemory Core
//!
//! Sectored cognitive memory engine for long-lived agents:
//!
//! - **Five fixed sectors**: episodic, semantic, procedural, emotional,
//!   reflective, each with its own routing weight, decay half-life and
//!   salience floor
//! - **Hybrid retrieval**: per-sector ANN over waypoint-restricted cosine
//!   scans, fused with salience-times-recency, keyword overlap and
//!   cross-sector resonance
//! - **Lifecycle dynamics**: salience reinforcement on access, exponential
//!   time decay with tombstoning, associative reinforcement propagation
//!   over a sparse edge graph
//! - **Background consolidation**: near-duplicate clusters distill into
//!   synthetic `reflective` memories; weak waypoints and edges are pruned
//! - **Durable metadata**: SQLite tables for memories, vectors, waypoints,
//!   edges, keywords, stats and users
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use openmemory_core::{AddInput, MemoryEngine, QueryFilters};
//!
//! // Open an engine at the platform default data directory
//! let engine = MemoryEngine::with_defaults(None)?;
//!
//! // Store a memory
//! let added = engine.add(AddInput::new("The quick brown fox"))?;
//!
//! // Retrieve
//! let matches = engine.query("quick fox", 5, &QueryFilters::default())?;
//!
//! // Reinforce what mattered
//! engine.reinforce(&added.id, 0.1)?;
//! ```
//!
//! Embedding providers live outside the core: implement [`Embedder`] and
//! hand it to [`MemoryEngine::new`]. The deterministic [`SyntheticEmbedder`]
//! ships in-crate and doubles as the cold-start fallback, so writes never
//! block on a provider.

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod embed;
pub mod engine;
pub mod error;
pub mod index;
pub mod memory;
pub mod scheduler;
pub mod store;
pub mod vector;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Memory types
pub use memory::{
    AddInput, AddOutcome, DecayReport, ListFilter, Memory, Metadata, PropagationOutcome,
    PruneReport, QueryFilters, QueryMatch, ReflectionReport, ReinforceOutcome, Sector, SectorMap,
};

// Engine facade
pub use engine::{CountersSnapshot, MemoryEngine};

// Scheduler
pub use scheduler::Scheduler;

// Configuration
pub use config::{ConfigPatch, EngineConfig, FusionWeights, SectorConfig, WaypointConfig};

// Errors
pub use error::{EngineError, Result};

// Embedder capability
pub use embed::{cosine_similarity, EmbedError, Embedder, SyntheticEmbedder};

// Storage layer
pub use store::{MetadataStore, StoreError};

// Vector store
pub use vector::{VectorStore, VectorStoreError};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        AddInput, AddOutcome, EngineConfig, EngineError, Embedder, ListFilter, Memory,
        MemoryEngine, QueryFilters, QueryMatch, Result, Scheduler, Sector, SyntheticEmbedder,
    };
}
