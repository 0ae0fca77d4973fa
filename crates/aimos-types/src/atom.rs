//! Atoms, snapshots, and witness stubs: the immutable records of the CMC.

use crate::canonical::{canonical_json, sha256_hex};
use crate::error::{AimosError, AimosResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Largest number of tags an atom may carry.
pub const MAX_TAGS: usize = 20;
/// Longest tag key accepted at ingestion.
pub const MAX_TAG_KEY_LEN: usize = 50;
/// Upper bound for a tag weight (lower bound is zero).
pub const MAX_TAG_WEIGHT: f64 = 1.0;
/// Tag consulted by the HHNI gate in the memory store.
pub const PRIORITY_TAG: &str = "priority";

/// Uncertainty band attached to a witness stub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Uncertainty {
    /// Coarse band label (green / amber / red).
    pub band: String,
    /// Expected calibration error, when known.
    pub ece: Option<f64>,
}

impl Default for Uncertainty {
    fn default() -> Self {
        Self {
            band: "green".to_string(),
            ece: None,
        }
    }
}

/// Provenance stub carried by atoms and snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WitnessStub {
    /// Model that produced the record, if any.
    pub model_id: Option<String>,
    /// Tools involved in producing the record.
    pub tool_ids: Vec<String>,
    /// Snapshot the record was produced under.
    pub snapshot_id: Option<String>,
    /// Correlation id of the originating request.
    pub correlation_id: Option<String>,
    /// Calibration info.
    pub uncertainty: Uncertainty,
}

impl WitnessStub {
    /// A stub carrying only a correlation id.
    pub fn correlated(correlation_id: Option<&str>) -> Self {
        Self {
            correlation_id: correlation_id.map(str::to_string),
            ..Default::default()
        }
    }
}

/// Payload of an atom: inline text or a URI reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomContent {
    /// Inline payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<String>,
    /// External reference to the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// MIME type of the payload.
    #[serde(default = "default_media_type")]
    pub media_type: String,
}

fn default_media_type() -> String {
    "text/plain".to_string()
}

impl AtomContent {
    /// Inline plain-text content.
    pub fn inline(text: impl Into<String>) -> Self {
        Self {
            inline: Some(text.into()),
            uri: None,
            media_type: default_media_type(),
        }
    }

    /// URI-only content.
    pub fn uri(uri: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            inline: None,
            uri: Some(uri.into()),
            media_type: media_type.into(),
        }
    }

    /// True when the payload lives only behind a URI.
    pub fn is_uri_only(&self) -> bool {
        self.inline.is_none() && self.uri.is_some()
    }
}

/// Caller input for atom creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomCreate {
    /// Modality tag (text, witness, plan-execution, ...).
    pub modality: String,
    /// Payload.
    pub content: AtomContent,
    /// Tag → weight map.
    #[serde(default)]
    pub tags: BTreeMap<String, f64>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Optional caller-supplied embedding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Policy labels attached to the atom.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_tags: Vec<String>,
}

impl AtomCreate {
    /// A text atom with no tags or metadata.
    pub fn text(modality: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            modality: modality.into(),
            content: AtomContent::inline(text),
            tags: BTreeMap::new(),
            metadata: BTreeMap::new(),
            embedding: None,
            policy_tags: Vec::new(),
        }
    }

    /// Builder-style tag insertion.
    pub fn with_tag(mut self, key: impl Into<String>, weight: f64) -> Self {
        self.tags.insert(key.into(), weight);
        self
    }

    /// Builder-style metadata insertion.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The `priority` tag weight, if present.
    pub fn priority(&self) -> Option<f64> {
        self.tags.get(PRIORITY_TAG).copied()
    }

    /// Reject inputs that must never reach the repository.
    pub fn validate(&self) -> AimosResult<()> {
        if self.modality.trim().is_empty() {
            return Err(AimosError::validation("modality must be non-empty"));
        }
        if self.content.inline.is_none() && self.content.uri.is_none() {
            return Err(AimosError::validation(
                "content requires an inline payload or a uri",
            ));
        }
        if self.tags.len() > MAX_TAGS {
            return Err(AimosError::Validation(format!(
                "too many tags: {} (max {MAX_TAGS})",
                self.tags.len()
            )));
        }
        for (key, weight) in &self.tags {
            if key.is_empty() || key.len() > MAX_TAG_KEY_LEN {
                return Err(AimosError::Validation(format!(
                    "tag key '{key}' must be 1..={MAX_TAG_KEY_LEN} characters"
                )));
            }
            if !weight.is_finite() || *weight < 0.0 || *weight > MAX_TAG_WEIGHT {
                return Err(AimosError::Validation(format!(
                    "tag '{key}' has invalid weight {weight}; expected a value in [0, {MAX_TAG_WEIGHT}]"
                )));
            }
        }
        if let Some(embedding) = &self.embedding {
            if embedding.iter().any(|v| !v.is_finite()) {
                return Err(AimosError::validation("embedding contains non-finite values"));
            }
        }
        Ok(())
    }

    /// Content hash over the canonical record. Timestamps never participate.
    pub fn content_hash(&self) -> AimosResult<String> {
        Ok(sha256_hex(canonical_json(self)?))
    }
}

/// Immutable unit of memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    /// Stable identifier derived from `hash` and `creation_key`.
    pub id: String,
    /// Position in the store's creation order.
    pub creation_key: u64,
    /// Modality tag.
    pub modality: String,
    /// Payload.
    pub content: AtomContent,
    /// Tag → weight map.
    #[serde(default)]
    pub tags: BTreeMap<String, f64>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Optional embedding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Policy labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_tags: Vec<String>,
    /// Canonical content hash.
    pub hash: String,
    /// When the atom was created.
    pub created_at: DateTime<Utc>,
    /// Provenance stub.
    #[serde(default)]
    pub witness: WitnessStub,
}

impl Atom {
    /// Derive the atom id for a content hash at a creation position.
    pub fn derive_id(hash: &str, creation_key: u64) -> String {
        let digest = sha256_hex(format!("{hash}:{creation_key}"));
        digest[..32].to_string()
    }

    /// Build an atom from validated input.
    pub fn from_create(
        input: AtomCreate,
        creation_key: u64,
        created_at: DateTime<Utc>,
        witness: WitnessStub,
    ) -> AimosResult<Self> {
        input.validate()?;
        let hash = input.content_hash()?;
        Ok(Self {
            id: Self::derive_id(&hash, creation_key),
            creation_key,
            modality: input.modality,
            content: input.content,
            tags: input.tags,
            metadata: input.metadata,
            embedding: input.embedding,
            policy_tags: input.policy_tags,
            hash,
            created_at,
            witness,
        })
    }

    /// The hashed portion of the atom, as creation input.
    pub fn to_create(&self) -> AtomCreate {
        AtomCreate {
            modality: self.modality.clone(),
            content: self.content.clone(),
            tags: self.tags.clone(),
            metadata: self.metadata.clone(),
            embedding: self.embedding.clone(),
            policy_tags: self.policy_tags.clone(),
        }
    }

    /// Check that `hash` matches the content and `id` matches the hash.
    pub fn verify_identity(&self) -> AimosResult<()> {
        let hash = self.to_create().content_hash()?;
        if hash != self.hash {
            return Err(AimosError::Validation(format!(
                "atom {} content hash mismatch: stored {}, computed {hash}",
                self.id, self.hash
            )));
        }
        let expected = Self::derive_id(&hash, self.creation_key);
        if expected != self.id {
            return Err(AimosError::Validation(format!(
                "atom id {} does not match hash-derived id {expected}",
                self.id
            )));
        }
        Ok(())
    }

    /// Inline text, if any.
    pub fn text(&self) -> Option<&str> {
        self.content.inline.as_deref()
    }
}

/// Derived statistics stored with a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotStats {
    /// Number of atoms in the manifest.
    pub atom_count: usize,
    /// How many atoms carry each tag key.
    pub tag_counts: BTreeMap<String, usize>,
}

impl SnapshotStats {
    /// Compute statistics over a sequence of atoms.
    pub fn from_atoms<'a>(atoms: impl IntoIterator<Item = &'a Atom>) -> Self {
        let mut stats = Self::default();
        for atom in atoms {
            stats.atom_count += 1;
            for key in atom.tags.keys() {
                *stats.tag_counts.entry(key.clone()).or_insert(0) += 1;
            }
        }
        stats
    }
}

/// Deterministic manifest over the current atom sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Hash-derived identifier.
    pub id: String,
    /// When the snapshot was first recorded.
    pub created_at: DateTime<Utc>,
    /// Atom ids in creation order.
    pub atom_ids: Vec<String>,
    /// Previous snapshot in the chain.
    pub previous_id: Option<String>,
    /// Caller note.
    pub note: Option<String>,
    /// Derived statistics.
    #[serde(default)]
    pub stats: SnapshotStats,
    /// Provenance stub.
    #[serde(default)]
    pub witness: WitnessStub,
}

#[derive(Serialize)]
struct SnapshotIdentity<'a> {
    ids: &'a [String],
    note: &'a str,
    previous_id: Option<&'a str>,
}

impl Snapshot {
    /// Pure function of the ordered atom ids, previous id, and note.
    pub fn derive_id(
        atom_ids: &[String],
        previous_id: Option<&str>,
        note: Option<&str>,
    ) -> AimosResult<String> {
        let identity = SnapshotIdentity {
            ids: atom_ids,
            note: note.unwrap_or(""),
            previous_id,
        };
        Ok(sha256_hex(canonical_json(&identity)?))
    }

    /// Whether this snapshot already describes `atom_ids` with `note`.
    pub fn covers(&self, atom_ids: &[String], note: Option<&str>) -> bool {
        self.atom_ids == atom_ids && self.note.as_deref().unwrap_or("") == note.unwrap_or("")
    }
}

/// Read access to atom existence, used for cross-system checks.
pub trait AtomCatalog: Send + Sync {
    /// Creation time of the atom, or `None` when unknown.
    fn atom_created_at(&self, atom_id: &str) -> AimosResult<Option<DateTime<Utc>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_content_hashes_identically() {
        let a = AtomCreate::text("text", "alpha").with_tag("topic", 0.5);
        let b = AtomCreate::text("text", "alpha").with_tag("topic", 0.5);
        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());
        let c = AtomCreate::text("text", "beta").with_tag("topic", 0.5);
        assert_ne!(a.content_hash().unwrap(), c.content_hash().unwrap());
    }

    #[test]
    fn test_rejects_negative_and_nan_weights() {
        let neg = AtomCreate::text("text", "x").with_tag("w", -0.1);
        assert_eq!(neg.validate().unwrap_err().kind(), "validation_error");
        let nan = AtomCreate::text("text", "x").with_tag("w", f64::NAN);
        assert!(nan.validate().is_err());
        let ok = AtomCreate::text("text", "x").with_tag("w", 0.0);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_id_depends_on_creation_key() {
        let input = AtomCreate::text("text", "alpha");
        let a = Atom::from_create(input.clone(), 1, Utc::now(), WitnessStub::default()).unwrap();
        let b = Atom::from_create(input, 2, Utc::now(), WitnessStub::default()).unwrap();
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.id, b.id);
        assert!(a.verify_identity().is_ok());
    }

    #[test]
    fn test_verify_identity_detects_tampering() {
        let mut atom = Atom::from_create(
            AtomCreate::text("text", "alpha"),
            7,
            Utc::now(),
            WitnessStub::default(),
        )
        .unwrap();
        atom.content = AtomContent::inline("tampered");
        assert!(atom.verify_identity().is_err());
    }

    #[test]
    fn test_snapshot_id_ignores_wall_clock() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let first = Snapshot::derive_id(&ids, None, Some("baseline")).unwrap();
        let second = Snapshot::derive_id(&ids, None, Some("baseline")).unwrap();
        assert_eq!(first, second);
        let other_note = Snapshot::derive_id(&ids, None, Some("other")).unwrap();
        assert_ne!(first, other_note);
        let reordered = Snapshot::derive_id(&["b".into(), "a".into()], None, Some("baseline")).unwrap();
        assert_ne!(first, reordered);
    }
}
