//! Memory store facade: ingestion, snapshots, recall and status.

use crate::metrics::{self, MetricsRegistry, MetricsSnapshot};
use crate::repository::{open_repository, AtomRepository, JournalIntegrity};
use aimos_hhni::index::{HierarchicalIndex, IndexNode};
use aimos_types::atom::{
    Atom, AtomCatalog, AtomContent, AtomCreate, Snapshot, SnapshotStats, WitnessStub,
};
use aimos_types::canonical::sha256_hex;
use aimos_types::config::{Backend, HhniConfig, StoreConfig};
use aimos_types::witness::{WitnessEmitter, WitnessRecord};
use aimos_types::{AimosError, AimosResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Directory (under the store dir) holding offloaded payloads.
pub const PAYLOAD_DIR: &str = "payloads";

/// Point-in-time view of a store.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub backend: Backend,
    pub store_dir: PathBuf,
    pub atom_count: u64,
    pub snapshot_count: usize,
    pub latest_snapshot_id: Option<String>,
    pub latest_snapshot_at: Option<DateTime<Utc>>,
    pub inline_payload_bytes: u64,
    pub metrics: MetricsSnapshot,
}

/// Facade over one atom repository.
pub struct MemoryStore {
    config: StoreConfig,
    repo: Arc<dyn AtomRepository>,
    metrics: Arc<MetricsRegistry>,
    witness: Option<Arc<dyn WitnessEmitter>>,
    priority_threshold: f64,
    /// Serializes create_atom / create_snapshot so keys and manifests agree.
    write_lock: Mutex<()>,
    inline_bytes: AtomicU64,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Open the store described by `config`.
    pub fn open(config: StoreConfig) -> AimosResult<Self> {
        let repo = open_repository(&config)?;
        Self::with_repository(config, repo)
    }

    /// Wrap an already-open repository.
    pub fn with_repository(config: StoreConfig, repo: Arc<dyn AtomRepository>) -> AimosResult<Self> {
        let inline_bytes: u64 = repo
            .fetch_atoms(None, 0, None)?
            .iter()
            .map(|a| a.content.inline.as_ref().map_or(0, |s| s.len() as u64))
            .sum();
        Ok(Self {
            config,
            repo,
            metrics: metrics::global(),
            witness: None,
            priority_threshold: HhniConfig::default().priority_threshold,
            write_lock: Mutex::new(()),
            inline_bytes: AtomicU64::new(inline_bytes),
            closed: AtomicBool::new(false),
        })
    }

    /// Use a private metrics registry instead of the process-wide one.
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_witness_emitter(mut self, emitter: Arc<dyn WitnessEmitter>) -> Self {
        self.witness = Some(emitter);
        self
    }

    /// Priority at or above which `create_atom_with_hhni` always indexes.
    pub fn with_priority_threshold(mut self, threshold: f64) -> Self {
        self.priority_threshold = threshold;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn AtomRepository> {
        &self.repo
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    fn ensure_open(&self) -> AimosResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AimosError::Storage("memory store is closed".to_string()));
        }
        Ok(())
    }

    /// Move an oversized inline payload to `payloads/<sha256>.json`.
    fn offload_if_large(&self, mut input: AtomCreate) -> AimosResult<AtomCreate> {
        let Some(text) = input.content.inline.as_ref() else {
            return Ok(input);
        };
        if text.len() <= self.config.max_inline_payload {
            return Ok(input);
        }
        let bytes = text.len();
        let digest = sha256_hex(text.as_bytes());
        let dir = self.config.dir.join(PAYLOAD_DIR);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{digest}.json"));
        let body = serde_json::to_vec(&json!({
            "media_type": input.content.media_type,
            "content": text,
        }))?;
        std::fs::write(&path, body)?;
        let path = path.canonicalize()?;

        input.content = AtomContent::uri(format!("file://{}", path.display()), input.content.media_type.clone());
        input.metadata.insert("payload_offload".to_string(), json!(true));
        input.metadata.insert("payload_bytes".to_string(), json!(bytes));
        debug!(bytes, path = %path.display(), "Offloaded inline payload");
        Ok(input)
    }

    /// Validate, hash and persist a new atom.
    pub fn create_atom(&self, input: AtomCreate, correlation_id: Option<&str>) -> AimosResult<Atom> {
        self.ensure_open()?;
        input.validate()?;
        let _guard = self.write_lock.lock();

        let input = self.offload_if_large(input)?;
        let inline_len = input.content.inline.as_ref().map_or(0, |s| s.len() as u64);
        let used = self.inline_bytes.load(Ordering::Acquire);
        if used + inline_len > self.config.max_total_payload {
            return Err(AimosError::BudgetExceeded {
                requested: inline_len,
                available: self.config.max_total_payload.saturating_sub(used),
            });
        }

        let key = self.repo.next_creation_key()?;
        let atom = Atom::from_create(input, key, Utc::now(), WitnessStub::correlated(correlation_id))?;
        if let Err(e) = self.repo.insert_atom(&atom) {
            self.metrics.record_write_error();
            return Err(e);
        }
        self.inline_bytes.fetch_add(inline_len, Ordering::AcqRel);
        let counter = self.metrics.record_atom(&atom.modality);
        info!(
            action = "atom.create",
            correlation_id = correlation_id.unwrap_or_default(),
            atom_id = %atom.id,
            modality = %atom.modality,
            creation_key = atom.creation_key,
            counter,
            "Atom created"
        );
        Ok(atom)
    }

    /// Persist the atom, then index it when asked to or when its priority
    /// tag reaches the threshold.
    ///
    /// The atom stays committed if indexing fails; the error propagates.
    pub async fn create_atom_with_hhni(
        &self,
        input: AtomCreate,
        build_hhni: bool,
        correlation_id: Option<&str>,
        index: &HierarchicalIndex,
    ) -> AimosResult<(Atom, Vec<IndexNode>)> {
        let gated = build_hhni
            || input
                .priority()
                .is_some_and(|p| p >= self.priority_threshold);
        let atom = self.create_atom(input, correlation_id)?;
        if !gated {
            return Ok((atom, Vec::new()));
        }

        index.gates().check_content(&atom.content)?;
        let text = atom.text().unwrap_or_default();
        let root = index.index_document(text, &atom.id).await?;
        let nodes = index.document_nodes(&atom.id);
        info!(
            action = "hhni.build",
            correlation_id = correlation_id.unwrap_or_default(),
            atom_id = %atom.id,
            root = %root,
            nodes = nodes.len(),
            "Indexed atom"
        );
        Ok((atom, nodes))
    }

    /// Snapshot the current atom sequence.
    ///
    /// Returns the latest snapshot unchanged when it already covers the same
    /// atoms and note.
    pub fn create_snapshot(&self, note: Option<&str>, correlation_id: Option<&str>) -> AimosResult<Snapshot> {
        self.ensure_open()?;
        let started = Instant::now();
        let _guard = self.write_lock.lock();

        let atoms = self.repo.fetch_atoms(None, 0, None)?;
        let atom_ids: Vec<String> = atoms.iter().map(|a| a.id.clone()).collect();
        let latest = self.repo.latest_snapshot()?;
        if let Some(latest) = latest.as_ref().filter(|s| s.covers(&atom_ids, note)) {
            debug!(snapshot_id = %latest.id, "Snapshot unchanged; reusing latest");
            return Ok(latest.clone());
        }

        let previous_id = latest.map(|s| s.id);
        let id = Snapshot::derive_id(&atom_ids, previous_id.as_deref(), note)?;
        if let Some(existing) = self.repo.fetch_snapshot(&id)? {
            return Ok(existing);
        }
        let snapshot = Snapshot {
            id,
            created_at: Utc::now(),
            stats: SnapshotStats::from_atoms(&atoms),
            atom_ids,
            previous_id,
            note: note.map(str::to_string),
            witness: WitnessStub::correlated(correlation_id),
        };
        if let Err(e) = self.repo.insert_snapshot(&snapshot) {
            self.metrics.record_write_error();
            return Err(e);
        }

        let seconds = started.elapsed().as_secs_f64();
        let counter = self.metrics.record_snapshot(seconds);
        info!(
            action = "snapshot.create",
            correlation_id = correlation_id.unwrap_or_default(),
            snapshot_id = %snapshot.id,
            note = note.unwrap_or_default(),
            atom_count = snapshot.atom_ids.len(),
            duration_ms = seconds * 1000.0,
            counter,
            "Snapshot created"
        );
        self.emit_witness(
            WitnessRecord::new("snapshot.create", correlation_id)
                .input("note", json!(note))
                .input("previous_id", json!(snapshot.previous_id))
                .output("snapshot_id", json!(snapshot.id))
                .output("atom_count", json!(snapshot.atom_ids.len())),
        );
        Ok(snapshot)
    }

    fn emit_witness(&self, record: WitnessRecord) {
        let Some(emitter) = &self.witness else {
            return;
        };
        match emitter.emit(&record) {
            Ok(witness_id) => debug!(emitter = emitter.name(), witness_id = %witness_id, action = %record.action, "Witness emitted"),
            Err(e) => warn!(emitter = emitter.name(), error = %e, "Witness emission failed"),
        }
    }

    /// Atoms in creation order.
    pub fn list_atoms(&self, limit: Option<usize>, offset: usize, tag: Option<&str>) -> AimosResult<Vec<Atom>> {
        self.ensure_open()?;
        self.repo.fetch_atoms(limit, offset, tag)
    }

    pub fn get_atom(&self, id: &str) -> AimosResult<Option<Atom>> {
        self.ensure_open()?;
        self.repo.get_atom(id)
    }

    pub fn count_atoms(&self) -> AimosResult<u64> {
        self.ensure_open()?;
        self.repo.count_atoms()
    }

    pub fn get_snapshot(&self, id: &str) -> AimosResult<Option<Snapshot>> {
        self.ensure_open()?;
        self.repo.fetch_snapshot(id)
    }

    pub fn list_snapshots(&self) -> AimosResult<Vec<Snapshot>> {
        self.ensure_open()?;
        self.repo.fetch_snapshots()
    }

    /// Atoms referenced by a snapshot, in snapshot order.
    pub fn replay_snapshot(&self, id: &str) -> AimosResult<Vec<Atom>> {
        self.ensure_open()?;
        let snapshot = self
            .repo
            .fetch_snapshot(id)?
            .ok_or_else(|| AimosError::NotFound(format!("snapshot {id}")))?;
        snapshot
            .atom_ids
            .iter()
            .map(|atom_id| {
                self.repo.get_atom(atom_id)?.ok_or_else(|| {
                    AimosError::Corruption(format!("snapshot {id} references missing atom {atom_id}"))
                })
            })
            .collect()
    }

    pub fn status_summary(&self) -> AimosResult<StatusSummary> {
        self.ensure_open()?;
        let snapshots = self.repo.fetch_snapshots()?;
        let latest = snapshots.last();
        Ok(StatusSummary {
            backend: self.repo.backend(),
            store_dir: self.config.dir.clone(),
            atom_count: self.repo.count_atoms()?,
            snapshot_count: snapshots.len(),
            latest_snapshot_id: latest.map(|s| s.id.clone()),
            latest_snapshot_at: latest.map(|s| s.created_at),
            inline_payload_bytes: self.inline_bytes.load(Ordering::Acquire),
            metrics: self.metrics.snapshot(),
        })
    }

    pub fn journal_integrity(&self) -> JournalIntegrity {
        self.repo.integrity()
    }

    /// Flush and release the backend. Safe to call more than once.
    pub fn close(&self) -> AimosResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        self.repo.close()?;
        info!(dir = %self.config.dir.display(), "Memory store closed");
        Ok(())
    }
}

impl AtomCatalog for MemoryStore {
    fn atom_created_at(&self, atom_id: &str) -> AimosResult<Option<DateTime<Utc>>> {
        Ok(self.get_atom(atom_id)?.map(|a| a.created_at))
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close memory store");
        }
    }
}
