//! Witness emission hook.
//!
//! The core does not author witness schemas; it hands a structured record to
//! whatever emitter the host registered at construction time.

use crate::error::AimosResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Structured provenance record handed to a [`WitnessEmitter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WitnessRecord {
    /// Operation that produced the record (e.g. `snapshot.create`).
    pub action: String,
    pub correlation_id: Option<String>,
    /// Confidence in the operation's output, in [0, 1].
    pub confidence: f64,
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

impl WitnessRecord {
    pub fn new(action: impl Into<String>, correlation_id: Option<&str>) -> Self {
        Self {
            action: action.into(),
            correlation_id: correlation_id.map(str::to_string),
            confidence: 1.0,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn output(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }
}

/// Sink for witness records. Returns the id assigned to the record.
pub trait WitnessEmitter: Send + Sync {
    /// Name under which the emitter is registered.
    fn name(&self) -> &str;

    /// Persist or forward one record.
    fn emit(&self, record: &WitnessRecord) -> AimosResult<String>;
}
