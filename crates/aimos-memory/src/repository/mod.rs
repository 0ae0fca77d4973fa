//! The atom repository: the only component that mutates persisted state.
//!
//! One trait, two backends selected at runtime: [`sqlite::SqliteRepository`]
//! (WAL-mode relational store) and [`journal::JournalRepository`]
//! (checksummed append-only logs).

pub mod journal;
pub mod sqlite;

use aimos_types::atom::{Atom, Snapshot};
use aimos_types::config::{Backend, StoreConfig};
use aimos_types::mpd::{BitemporalEdge, EdgeFilter, MpdNode, NodeFilter, TimeAxis, DEPENDS_ON};
use aimos_types::{AimosError, AimosResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Per-stream health of the journal files. Always healthy for sqlite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JournalIntegrity {
    pub atoms_log_ok: bool,
    pub snapshots_log_ok: bool,
    pub nodes_log_ok: bool,
    pub edges_log_ok: bool,
}

impl JournalIntegrity {
    pub const HEALTHY: JournalIntegrity = JournalIntegrity {
        atoms_log_ok: true,
        snapshots_log_ok: true,
        nodes_log_ok: true,
        edges_log_ok: true,
    };

    pub fn all_ok(&self) -> bool {
        self.atoms_log_ok && self.snapshots_log_ok && self.nodes_log_ok && self.edges_log_ok
    }
}

/// Storage capability set shared by every backend.
pub trait AtomRepository: Send + Sync {
    fn backend(&self) -> Backend;

    /// Creation key the next inserted atom must carry.
    fn next_creation_key(&self) -> AimosResult<u64>;

    /// Persist an atom. Its id must match its hash and creation key;
    /// re-inserting a stored id is a no-op.
    fn insert_atom(&self, atom: &Atom) -> AimosResult<()>;

    /// Atoms ordered by creation key, optionally restricted to those whose
    /// tag map contains `tag`.
    fn fetch_atoms(&self, limit: Option<usize>, offset: usize, tag: Option<&str>) -> AimosResult<Vec<Atom>>;

    fn get_atom(&self, id: &str) -> AimosResult<Option<Atom>>;

    fn count_atoms(&self) -> AimosResult<u64>;

    /// Persist a snapshot. Re-inserting an existing id is a no-op.
    fn insert_snapshot(&self, snapshot: &Snapshot) -> AimosResult<()>;

    /// Every snapshot in insertion order.
    fn fetch_snapshots(&self) -> AimosResult<Vec<Snapshot>>;

    fn fetch_snapshot(&self, id: &str) -> AimosResult<Option<Snapshot>>;

    fn latest_snapshot(&self) -> AimosResult<Option<Snapshot>>;

    /// Store one node version: same `(mpd_id, tt_start)` updates in place,
    /// otherwise earlier open versions are closed at the new `tt_start`.
    fn write_mpd_node(&self, node: &MpdNode) -> AimosResult<()>;

    fn fetch_mpd_nodes(&self, filter: &NodeFilter) -> AimosResult<Vec<MpdNode>>;

    /// Every version of one node, ordered by `tt_start`.
    fn fetch_node_versions(&self, mpd_id: &str) -> AimosResult<Vec<MpdNode>>;

    /// The version of `mpd_id` whose transaction interval is still open.
    fn current_mpd_node(&self, mpd_id: &str) -> AimosResult<Option<MpdNode>>;

    /// Node versions whose `axis` interval starts at or before `to` and is
    /// open or ends at or after `from`, ordered by `(mpd_id, tt_start)`.
    ///
    /// This is a candidate set: callers apply their exact window test.
    fn fetch_nodes_overlapping(
        &self,
        axis: TimeAxis,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AimosResult<Vec<MpdNode>>;

    /// Store one edge version, keyed by `(source, target, relation)` the way
    /// nodes are keyed by id.
    fn write_mpd_edge(&self, edge: &BitemporalEdge) -> AimosResult<()>;

    fn fetch_mpd_edges(&self, filter: &EdgeFilter) -> AimosResult<Vec<BitemporalEdge>>;

    /// Every version of one `(source, target, relation)` edge, ordered by
    /// `tt_start`.
    fn fetch_edge_versions(&self, source: &str, target: &str, relation: &str) -> AimosResult<Vec<BitemporalEdge>>;

    /// Edge counterpart of [`AtomRepository::fetch_nodes_overlapping`],
    /// ordered by key then `tt_start`.
    fn fetch_edges_overlapping(
        &self,
        axis: TimeAxis,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AimosResult<Vec<BitemporalEdge>>;

    fn integrity(&self) -> JournalIntegrity;

    /// Flush and release resources.
    fn close(&self) -> AimosResult<()>;

    /// Validate and store a node version.
    fn upsert_mpd_node(&self, node: &MpdNode) -> AimosResult<()> {
        validate_node(node)?;
        self.write_mpd_node(node)
    }

    /// Validate and store an edge version; returns the edge as stored.
    ///
    /// `depends_on` edges without policy packs inherit the source node's
    /// current packs and are rejected if that leaves them empty.
    fn upsert_mpd_edge(&self, edge: BitemporalEdge) -> AimosResult<BitemporalEdge> {
        let mut edge = edge;
        validate_edge(&edge)?;
        if edge.relation == DEPENDS_ON {
            let source = self.current_mpd_node(&edge.source)?;
            if edge.policy_pack_ids.is_empty() {
                if let Some(node) = &source {
                    edge.policy_pack_ids = node.policy_pack_ids.clone();
                }
            }
            if edge.policy_pack_ids.is_empty() {
                return Err(AimosError::Validation(format!(
                    "depends_on edge {} -> {} requires at least one policy pack",
                    edge.source, edge.target
                )));
            }
            if let Some(node) = source.filter(|n| n.max_dependency_degree > 0) {
                let open = self.fetch_mpd_edges(&EdgeFilter {
                    relation: Some(DEPENDS_ON.to_string()),
                    source: Some(edge.source.clone()),
                    ..EdgeFilter::default()
                })?;
                let others = open.iter().filter(|e| e.target != edge.target).count();
                if others + 1 > node.max_dependency_degree as usize {
                    return Err(AimosError::Validation(format!(
                        "node {} exceeds max_dependency_degree {}",
                        node.mpd_id, node.max_dependency_degree
                    )));
                }
            }
        }
        self.write_mpd_edge(&edge)?;
        Ok(edge)
    }

    fn upsert_mpd_nodes(&self, nodes: &[MpdNode]) -> AimosResult<()> {
        for node in nodes {
            self.upsert_mpd_node(node)?;
        }
        Ok(())
    }

    fn upsert_mpd_edges(&self, edges: Vec<BitemporalEdge>) -> AimosResult<Vec<BitemporalEdge>> {
        edges.into_iter().map(|e| self.upsert_mpd_edge(e)).collect()
    }
}

/// Open the backend named in `config`, creating the store directory.
pub fn open_repository(config: &StoreConfig) -> AimosResult<Arc<dyn AtomRepository>> {
    std::fs::create_dir_all(&config.dir)?;
    let repo: Arc<dyn AtomRepository> = match config.backend {
        Backend::Sqlite => Arc::new(sqlite::SqliteRepository::open(
            &config.dir.join(sqlite::DB_FILE),
            config.busy_timeout_ms,
        )?),
        Backend::Jsonl => Arc::new(journal::JournalRepository::open(&config.dir)?),
    };
    info!(backend = %config.backend, dir = %config.dir.display(), "Opened atom repository");
    Ok(repo)
}

/// Reject an atom whose identity or position is wrong.
pub(crate) fn check_atom(atom: &Atom, expected_key: u64) -> AimosResult<()> {
    atom.verify_identity()?;
    if atom.creation_key != expected_key {
        return Err(AimosError::Validation(format!(
            "atom {} has creation key {}, expected {expected_key}",
            atom.id, atom.creation_key
        )));
    }
    Ok(())
}

pub(crate) fn validate_node(node: &MpdNode) -> AimosResult<()> {
    if node.mpd_id.trim().is_empty() || node.node_type.trim().is_empty() {
        return Err(AimosError::validation("mpd node requires an id and a type"));
    }
    if node.tt_end.is_some_and(|end| end <= node.tt_start) {
        return Err(AimosError::Validation(format!(
            "node {}: tt_end must be after tt_start",
            node.mpd_id
        )));
    }
    if node.vt_end.is_some_and(|end| end < node.vt_start) {
        return Err(AimosError::Validation(format!(
            "node {}: vt_end precedes vt_start",
            node.mpd_id
        )));
    }
    Ok(())
}

fn validate_edge(edge: &BitemporalEdge) -> AimosResult<()> {
    if edge.source.trim().is_empty() || edge.target.trim().is_empty() || edge.relation.trim().is_empty() {
        return Err(AimosError::validation("mpd edge requires source, target and relation"));
    }
    if edge.tt_end.is_some_and(|end| end <= edge.tt_start) {
        return Err(AimosError::validation("edge tt_end must be after tt_start"));
    }
    Ok(())
}

/// In-memory form of the node upsert rule. `rows` stays ordered by
/// `tt_start`.
pub(crate) fn apply_node_upsert(rows: &mut Vec<MpdNode>, node: &MpdNode) {
    if let Some(existing) = rows
        .iter_mut()
        .find(|r| r.mpd_id == node.mpd_id && r.tt_start == node.tt_start)
    {
        *existing = node.clone();
        return;
    }
    for row in rows
        .iter_mut()
        .filter(|r| r.mpd_id == node.mpd_id && r.tt_end.is_none() && r.tt_start < node.tt_start)
    {
        row.tt_end = Some(node.tt_start);
    }
    let at = rows.partition_point(|r| r.tt_start <= node.tt_start);
    rows.insert(at, node.clone());
}

/// In-memory form of the edge upsert rule.
pub(crate) fn apply_edge_upsert(rows: &mut Vec<BitemporalEdge>, edge: &BitemporalEdge) {
    if let Some(existing) = rows
        .iter_mut()
        .find(|r| r.key() == edge.key() && r.tt_start == edge.tt_start)
    {
        *existing = edge.clone();
        return;
    }
    for row in rows
        .iter_mut()
        .filter(|r| r.key() == edge.key() && r.tt_end.is_none() && r.tt_start < edge.tt_start)
    {
        row.tt_end = Some(edge.tt_start);
    }
    let at = rows.partition_point(|r| r.tt_start <= edge.tt_start);
    rows.insert(at, edge.clone());
}
