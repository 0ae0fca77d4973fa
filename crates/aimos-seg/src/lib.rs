//! Semantic evidence graph for AIMOS.
//!
//! Entities, relations and evidence are versioned on transaction and valid
//! time. The graph answers time-slice queries, traces `DERIVES_FROM`
//! provenance and materializes explicit contradictions.

pub mod graph;
pub mod witness;

pub use graph::{RelationQuery, SegExport, SegGraph, SegStats};
pub use witness::JsonlWitnessEmitter;
