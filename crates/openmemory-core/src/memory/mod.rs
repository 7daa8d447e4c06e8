//! Memory module - core types and data structures
//!
//! The data model of the engine:
//! - `Sector` and the array-backed `SectorMap`
//! - `Memory` rows with salience, decay state and versioning
//! - schema-checked `Metadata`
//! - facade input/output types and maintenance reports

mod metadata;
mod record;
mod sector;

pub use metadata::Metadata;
pub use record::{
    AddInput, AddOutcome, DecayReport, ListFilter, Memory, PropagationOutcome, PruneReport,
    QueryFilters, QueryMatch, ReflectionReport, ReinforceOutcome,
};
pub use sector::{resonance, Sector, SectorMap, SECTOR_COUNT};
