//! Core types and traits for the AIMOS memory core.
//!
//! This crate defines the shared data structures used by the atom store, the
//! hierarchical index, and the evidence graph. It contains no business logic.

pub mod atom;
pub mod canonical;
pub mod config;
pub mod error;
pub mod index;
pub mod mpd;
pub mod seg;
pub mod witness;

pub use error::{AimosError, AimosResult};
