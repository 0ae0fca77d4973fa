//! Semantic Evidence Graph records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of a relation between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationKind {
    Supports,
    Contradicts,
    References,
    DerivesFrom,
    RelatesTo,
}

/// A versioned entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    /// Entity type (claim, dataset, person, ...).
    pub entity_type: String,
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub tt_start: DateTime<Utc>,
    pub tt_end: Option<DateTime<Utc>>,
    pub vt_start: DateTime<Utc>,
    pub vt_end: Option<DateTime<Utc>>,
    /// Confidence in [0, 1].
    pub confidence: f64,
    #[serde(default)]
    pub witness_id: Option<String>,
}

impl Entity {
    /// A fresh entity recorded and valid from `at`.
    pub fn new(
        id: impl Into<String>,
        entity_type: impl Into<String>,
        name: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            name: name.into(),
            attributes: BTreeMap::new(),
            tt_start: at,
            tt_end: None,
            vt_start: at,
            vt_end: None,
            confidence: 1.0,
            witness_id: None,
        }
    }

    /// Version in force on the transaction axis at `t`.
    pub fn recorded_at(&self, t: DateTime<Utc>) -> bool {
        self.tt_start <= t && self.tt_end.map_or(true, |end| end > t)
    }
}

/// Partial update applied by `update_entity`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityPatch {
    pub name: Option<String>,
    pub entity_type: Option<String>,
    /// Merged into the existing attributes.
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub confidence: Option<f64>,
    pub vt_end: Option<DateTime<Utc>>,
    pub witness_id: Option<String>,
}

/// A versioned relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub kind: RelationKind,
    pub confidence: f64,
    #[serde(default)]
    pub evidence_ids: Vec<String>,
    pub tt_start: DateTime<Utc>,
    pub tt_end: Option<DateTime<Utc>>,
    pub vt_start: DateTime<Utc>,
    pub vt_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub witness_id: Option<String>,
}

impl Relation {
    pub fn new(
        id: impl Into<String>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        kind: RelationKind,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            kind,
            confidence: 1.0,
            evidence_ids: Vec::new(),
            tt_start: at,
            tt_end: None,
            vt_start: at,
            vt_end: None,
            witness_id: None,
        }
    }

    pub fn recorded_at(&self, t: DateTime<Utc>) -> bool {
        self.tt_start <= t && self.tt_end.map_or(true, |end| end > t)
    }
}

/// A piece of evidence, optionally backed by a CMC atom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub id: String,
    pub content: String,
    pub source: String,
    /// Reliability of the source in [0, 1].
    pub reliability: f64,
    /// Confidence in the claim in [0, 1].
    pub confidence: f64,
    #[serde(default)]
    pub atom_id: Option<String>,
    pub tt_start: DateTime<Utc>,
    pub tt_end: Option<DateTime<Utc>>,
    pub vt_start: DateTime<Utc>,
    pub vt_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub witness_id: Option<String>,
}

impl Evidence {
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        source: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            source: source.into(),
            reliability: 1.0,
            confidence: 1.0,
            atom_id: None,
            tt_start: at,
            tt_end: None,
            vt_start: at,
            vt_end: None,
            witness_id: None,
        }
    }

    pub fn recorded_at(&self, t: DateTime<Utc>) -> bool {
        self.tt_start <= t && self.tt_end.map_or(true, |end| end > t)
    }
}

/// Materialized contradiction between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contradiction {
    pub id: String,
    pub entity1_id: String,
    pub entity2_id: String,
    pub contradiction_type: String,
    pub confidence: f64,
    pub explanation: String,
    pub detected_at: DateTime<Utc>,
    /// Relation the record was derived from.
    pub relation_id: String,
    /// Further relations between the same pair, in either direction,
    /// folded into this record.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_relation_ids: Vec<String>,
}

/// Counts of records in force at an instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlice {
    pub timestamp: DateTime<Utc>,
    pub entity_count: usize,
    pub relation_count: usize,
    pub evidence_count: usize,
}
