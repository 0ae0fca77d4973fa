//! Context memory core for AIMOS.
//!
//! Provides the atom store over two interchangeable repositories:
//! - **SQLite**: WAL-mode relational store
//! - **Journal**: append-only checksummed log files, one per stream
//!
//! On top of the repositories sit content-addressed snapshots, the
//! bitemporal MPD registry and its query engine, and process counters.

pub mod bitemporal;
pub mod btsm;
pub mod config;
pub mod metrics;
pub mod migration;
pub mod repository;
pub mod store;

pub use bitemporal::BitemporalQueryEngine;
pub use btsm::MpdRegistry;
pub use metrics::MetricsRegistry;
pub use repository::{open_repository, AtomRepository, JournalIntegrity};
pub use store::{MemoryStore, StatusSummary};
