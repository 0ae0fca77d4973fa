//! Journal backend: one append-only, checksummed log per stream.
//!
//! Every record is a single line `"<compact json>\t<crc32 hex>\n"`. The logs
//! are replayed into memory on open; any framing or checksum failure moves
//! the offending file to `quarantine/<timestamp>/` and refuses to open.

use super::{apply_edge_upsert, apply_node_upsert, check_atom, AtomRepository, JournalIntegrity};
use aimos_types::atom::{Atom, Snapshot};
use aimos_types::config::Backend;
use aimos_types::mpd::{BitemporalEdge, EdgeFilter, Interval, MpdNode, NodeFilter, TimeAxis};
use aimos_types::{AimosError, AimosResult};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

pub const ATOMS_LOG: &str = "atoms.log";
pub const SNAPSHOTS_LOG: &str = "snapshots.log";
pub const NODES_LOG: &str = "mpd_nodes.log";
pub const EDGES_LOG: &str = "mpd_edges.log";
pub const QUARANTINE_DIR: &str = "quarantine";

/// Why a journal line was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("line {line}: truncated record (no trailing newline)")]
    Truncated { line: usize },
    #[error("line {line}: empty record")]
    Empty { line: usize },
    #[error("line {line}: missing checksum separator")]
    MissingChecksum { line: usize },
    #[error("line {line}: malformed checksum '{found}'")]
    BadChecksum { line: usize, found: String },
    #[error("line {line}: checksum mismatch (stored {stored:08x}, computed {computed:08x})")]
    ChecksumMismatch { line: usize, stored: u32, computed: u32 },
    #[error("line {line}: invalid utf-8")]
    Utf8 { line: usize },
    #[error("line {line}: undecodable record: {reason}")]
    Decode { line: usize, reason: String },
}

/// Frame one record as a journal line.
pub fn encode_frame<T: Serialize>(record: &T) -> AimosResult<String> {
    let json = serde_json::to_string(record)?;
    let crc = crc32fast::hash(json.as_bytes());
    Ok(format!("{json}\t{crc:08x}\n"))
}

/// Validate and decode every line of a journal.
pub fn decode_frames<T: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<T>, FrameError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let body = match bytes.strip_suffix(b"\n") {
        Some(body) => body,
        None => {
            let line = bytes.iter().filter(|b| **b == b'\n').count() + 1;
            return Err(FrameError::Truncated { line });
        }
    };

    let mut records = Vec::new();
    for (i, raw) in body.split(|b| *b == b'\n').enumerate() {
        let line = i + 1;
        if raw.is_empty() {
            return Err(FrameError::Empty { line });
        }
        let text = std::str::from_utf8(raw).map_err(|_| FrameError::Utf8 { line })?;
        let (json, crc) = text
            .rsplit_once('\t')
            .ok_or(FrameError::MissingChecksum { line })?;
        if crc.len() != 8 || !crc.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(FrameError::BadChecksum {
                line,
                found: crc.to_string(),
            });
        }
        let stored = u32::from_str_radix(crc, 16).map_err(|_| FrameError::BadChecksum {
            line,
            found: crc.to_string(),
        })?;
        let computed = crc32fast::hash(json.as_bytes());
        if stored != computed {
            return Err(FrameError::ChecksumMismatch {
                line,
                stored,
                computed,
            });
        }
        let record = serde_json::from_str(json).map_err(|e| FrameError::Decode {
            line,
            reason: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

#[derive(Default)]
struct JournalState {
    atoms: Vec<Atom>,
    atom_index: HashMap<String, usize>,
    /// tag -> positions in `atoms`, ascending.
    tag_index: HashMap<String, Vec<usize>>,
    snapshots: Vec<Snapshot>,
    snapshot_index: HashMap<String, usize>,
    /// mpd_id -> versions ordered by `tt_start`.
    nodes: BTreeMap<String, Vec<MpdNode>>,
    /// (source, target, relation) -> versions ordered by `tt_start`.
    edges: BTreeMap<EdgeKey, Vec<BitemporalEdge>>,
}

type EdgeKey = (String, String, String);

fn edge_key(source: &str, target: &str, relation: &str) -> EdgeKey {
    (source.to_string(), target.to_string(), relation.to_string())
}

/// Candidate test shared by the overlap queries.
fn overlaps(iv: Interval, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
    iv.start <= to && iv.end.map_or(true, |end| end >= from)
}

impl JournalState {
    fn push_atom(&mut self, atom: Atom) {
        let position = self.atoms.len();
        for tag in atom.tags.keys() {
            self.tag_index.entry(tag.clone()).or_default().push(position);
        }
        self.atom_index.insert(atom.id.clone(), position);
        self.atoms.push(atom);
    }

    fn push_snapshot(&mut self, snapshot: Snapshot) {
        self.snapshot_index
            .insert(snapshot.id.clone(), self.snapshots.len());
        self.snapshots.push(snapshot);
    }

    fn next_key(&self) -> u64 {
        self.atoms.last().map_or(1, |a| a.creation_key + 1)
    }

    fn upsert_node(&mut self, node: &MpdNode) {
        apply_node_upsert(self.nodes.entry(node.mpd_id.clone()).or_default(), node);
    }

    fn upsert_edge(&mut self, edge: &BitemporalEdge) {
        let key = edge_key(&edge.source, &edge.target, &edge.relation);
        apply_edge_upsert(self.edges.entry(key).or_default(), edge);
    }

    fn node_rows(&self) -> impl Iterator<Item = &MpdNode> {
        self.nodes.values().flatten()
    }

    /// Edge versions in key order, restricted to one source when given.
    fn edge_rows<'a>(&'a self, source: Option<&'a str>) -> Box<dyn Iterator<Item = &'a BitemporalEdge> + 'a> {
        match source {
            Some(source) => Box::new(
                self.edges
                    .range(edge_key(source, "", "")..)
                    .take_while(move |(key, _)| key.0 == source)
                    .flat_map(|(_, rows)| rows),
            ),
            None => Box::new(self.edges.values().flatten()),
        }
    }
}

struct Writers {
    atoms: File,
    snapshots: File,
    nodes: File,
    edges: File,
}

/// Append-only journal repository.
pub struct JournalRepository {
    dir: PathBuf,
    state: RwLock<JournalState>,
    writers: Mutex<Writers>,
}

impl JournalRepository {
    /// Replay every journal under `dir`.
    ///
    /// Corrupt journals are quarantined and the first one is reported as
    /// [`AimosError::JournalCorruption`]; healthy streams stay in place.
    pub fn open(dir: &Path) -> AimosResult<Self> {
        std::fs::create_dir_all(dir)?;

        let atoms = load_stream::<Atom>(dir, ATOMS_LOG);
        let snapshots = load_stream::<Snapshot>(dir, SNAPSHOTS_LOG);
        let nodes = load_stream::<MpdNode>(dir, NODES_LOG);
        let edges = load_stream::<BitemporalEdge>(dir, EDGES_LOG);

        let mut first_failure = None;
        let atoms = settle(dir, ATOMS_LOG, atoms, &mut first_failure);
        let snapshots = settle(dir, SNAPSHOTS_LOG, snapshots, &mut first_failure);
        let nodes = settle(dir, NODES_LOG, nodes, &mut first_failure);
        let edges = settle(dir, EDGES_LOG, edges, &mut first_failure);
        if let Some(err) = first_failure {
            return Err(err);
        }

        let mut state = JournalState::default();
        for atom in atoms {
            state.push_atom(atom);
        }
        for snapshot in snapshots {
            state.push_snapshot(snapshot);
        }
        for node in &nodes {
            state.upsert_node(node);
        }
        for edge in &edges {
            state.upsert_edge(edge);
        }
        info!(
            dir = %dir.display(),
            atoms = state.atoms.len(),
            snapshots = state.snapshots.len(),
            node_versions = state.node_rows().count(),
            edge_versions = state.edge_rows(None).count(),
            "Replayed journals"
        );

        let writers = Writers {
            atoms: open_append(&dir.join(ATOMS_LOG))?,
            snapshots: open_append(&dir.join(SNAPSHOTS_LOG))?,
            nodes: open_append(&dir.join(NODES_LOG))?,
            edges: open_append(&dir.join(EDGES_LOG))?,
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            state: RwLock::new(state),
            writers: Mutex::new(writers),
        })
    }

    /// Directory holding the journals.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Read one stream. A missing file is an empty stream.
fn load_stream<T: DeserializeOwned>(dir: &Path, file: &str) -> Result<Vec<T>, FrameError> {
    let path = dir.join(file);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(FrameError::Decode {
                line: 0,
                reason: e.to_string(),
            })
        }
    };
    decode_frames(&bytes)
}

/// Turn a stream load result into records, quarantining on failure.
fn settle<T>(
    dir: &Path,
    file: &str,
    loaded: Result<Vec<T>, FrameError>,
    first_failure: &mut Option<AimosError>,
) -> Vec<T> {
    let err = match loaded {
        Ok(records) => return records,
        Err(err) => err,
    };
    let path = dir.join(file);
    let quarantined_to = match quarantine(dir, file) {
        Ok(dest) => Some(dest),
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to quarantine corrupt journal");
            None
        }
    };
    error!(
        path = %path.display(),
        reason = %err,
        quarantined_to = ?quarantined_to,
        "Journal failed validation"
    );
    if first_failure.is_none() {
        *first_failure = Some(AimosError::JournalCorruption {
            path,
            reason: err.to_string(),
            quarantined_to,
        });
    }
    Vec::new()
}

fn quarantine(dir: &Path, file: &str) -> std::io::Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%6fZ").to_string();
    let target_dir = dir.join(QUARANTINE_DIR).join(stamp);
    std::fs::create_dir_all(&target_dir)?;
    let dest = target_dir.join(file);
    std::fs::rename(dir.join(file), &dest)?;
    Ok(dest)
}

fn open_append(path: &Path) -> AimosResult<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn append_line(file: &mut File, line: &str) -> AimosResult<()> {
    file.write_all(line.as_bytes())?;
    file.sync_data()?;
    Ok(())
}

impl AtomRepository for JournalRepository {
    fn backend(&self) -> Backend {
        Backend::Jsonl
    }

    fn next_creation_key(&self) -> AimosResult<u64> {
        Ok(self.state.read().next_key())
    }

    fn insert_atom(&self, atom: &Atom) -> AimosResult<()> {
        let mut writers = self.writers.lock();
        if self.state.read().atom_index.contains_key(&atom.id) {
            atom.verify_identity()?;
            return Ok(());
        }
        check_atom(atom, self.state.read().next_key())?;
        append_line(&mut writers.atoms, &encode_frame(atom)?)?;
        self.state.write().push_atom(atom.clone());
        Ok(())
    }

    fn fetch_atoms(&self, limit: Option<usize>, offset: usize, tag: Option<&str>) -> AimosResult<Vec<Atom>> {
        let state = self.state.read();
        let limit = limit.unwrap_or(usize::MAX);
        let atoms = match tag {
            Some(tag) => state
                .tag_index
                .get(tag)
                .map(|positions| {
                    positions
                        .iter()
                        .skip(offset)
                        .take(limit)
                        .map(|&p| state.atoms[p].clone())
                        .collect()
                })
                .unwrap_or_default(),
            None => state.atoms.iter().skip(offset).take(limit).cloned().collect(),
        };
        Ok(atoms)
    }

    fn get_atom(&self, id: &str) -> AimosResult<Option<Atom>> {
        let state = self.state.read();
        Ok(state.atom_index.get(id).map(|&p| state.atoms[p].clone()))
    }

    fn count_atoms(&self) -> AimosResult<u64> {
        Ok(self.state.read().atoms.len() as u64)
    }

    fn insert_snapshot(&self, snapshot: &Snapshot) -> AimosResult<()> {
        let mut writers = self.writers.lock();
        if self.state.read().snapshot_index.contains_key(&snapshot.id) {
            return Ok(());
        }
        append_line(&mut writers.snapshots, &encode_frame(snapshot)?)?;
        self.state.write().push_snapshot(snapshot.clone());
        Ok(())
    }

    fn fetch_snapshots(&self) -> AimosResult<Vec<Snapshot>> {
        Ok(self.state.read().snapshots.clone())
    }

    fn fetch_snapshot(&self, id: &str) -> AimosResult<Option<Snapshot>> {
        let state = self.state.read();
        Ok(state.snapshot_index.get(id).map(|&p| state.snapshots[p].clone()))
    }

    fn latest_snapshot(&self) -> AimosResult<Option<Snapshot>> {
        Ok(self.state.read().snapshots.last().cloned())
    }

    fn write_mpd_node(&self, node: &MpdNode) -> AimosResult<()> {
        let mut writers = self.writers.lock();
        append_line(&mut writers.nodes, &encode_frame(node)?)?;
        self.state.write().upsert_node(node);
        Ok(())
    }

    fn fetch_mpd_nodes(&self, filter: &NodeFilter) -> AimosResult<Vec<MpdNode>> {
        let state = self.state.read();
        Ok(state.node_rows().filter(|n| filter.matches(n)).cloned().collect())
    }

    fn fetch_node_versions(&self, mpd_id: &str) -> AimosResult<Vec<MpdNode>> {
        Ok(self.state.read().nodes.get(mpd_id).cloned().unwrap_or_default())
    }

    fn current_mpd_node(&self, mpd_id: &str) -> AimosResult<Option<MpdNode>> {
        let state = self.state.read();
        Ok(state
            .nodes
            .get(mpd_id)
            .and_then(|rows| rows.iter().rev().find(|n| n.tt_end.is_none()))
            .cloned())
    }

    fn fetch_nodes_overlapping(
        &self,
        axis: TimeAxis,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AimosResult<Vec<MpdNode>> {
        let state = self.state.read();
        Ok(state
            .node_rows()
            .filter(|n| overlaps(n.interval(axis), from, to))
            .cloned()
            .collect())
    }

    fn write_mpd_edge(&self, edge: &BitemporalEdge) -> AimosResult<()> {
        let mut writers = self.writers.lock();
        append_line(&mut writers.edges, &encode_frame(edge)?)?;
        self.state.write().upsert_edge(edge);
        Ok(())
    }

    fn fetch_mpd_edges(&self, filter: &EdgeFilter) -> AimosResult<Vec<BitemporalEdge>> {
        let state = self.state.read();
        Ok(state
            .edge_rows(filter.source.as_deref())
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    fn fetch_edge_versions(&self, source: &str, target: &str, relation: &str) -> AimosResult<Vec<BitemporalEdge>> {
        let state = self.state.read();
        Ok(state
            .edges
            .get(&edge_key(source, target, relation))
            .cloned()
            .unwrap_or_default())
    }

    fn fetch_edges_overlapping(
        &self,
        axis: TimeAxis,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AimosResult<Vec<BitemporalEdge>> {
        let state = self.state.read();
        Ok(state
            .edge_rows(None)
            .filter(|e| overlaps(e.interval(axis), from, to))
            .cloned()
            .collect())
    }

    fn integrity(&self) -> JournalIntegrity {
        let check = |file: &str| {
            let result = load_stream::<serde_json::Value>(&self.dir, file);
            if let Err(e) = &result {
                warn!(file, reason = %e, "Journal integrity check failed");
            }
            result.is_ok()
        };
        JournalIntegrity {
            atoms_log_ok: check(ATOMS_LOG),
            snapshots_log_ok: check(SNAPSHOTS_LOG),
            nodes_log_ok: check(NODES_LOG),
            edges_log_ok: check(EDGES_LOG),
        }
    }

    fn close(&self) -> AimosResult<()> {
        let writers = self.writers.lock();
        for file in [&writers.atoms, &writers.snapshots, &writers.nodes, &writers.edges] {
            file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aimos_types::atom::{AtomCreate, WitnessStub};
    use chrono::{Duration, TimeZone};

    fn atom(text: &str, key: u64) -> Atom {
        Atom::from_create(
            AtomCreate::text("text", text).with_tag("topic", 0.5),
            key,
            Utc::now(),
            WitnessStub::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_frame_round_trip() {
        let line = encode_frame(&serde_json::json!({"a": 1})).unwrap();
        assert!(line.ends_with('\n'));
        let decoded: Vec<serde_json::Value> = decode_frames(line.as_bytes()).unwrap();
        assert_eq!(decoded, vec![serde_json::json!({"a": 1})]);
    }

    #[test]
    fn test_frame_errors() {
        let line = encode_frame(&serde_json::json!({"a": 1})).unwrap();
        let truncated = &line.as_bytes()[..line.len() - 1];
        assert_eq!(
            decode_frames::<serde_json::Value>(truncated).unwrap_err(),
            FrameError::Truncated { line: 1 }
        );
        assert!(matches!(
            decode_frames::<serde_json::Value>(b"{\"a\":1}\n").unwrap_err(),
            FrameError::MissingChecksum { line: 1 }
        ));
        assert!(matches!(
            decode_frames::<serde_json::Value>(b"{\"a\":1}\tZZZZZZZZ\n").unwrap_err(),
            FrameError::BadChecksum { .. }
        ));
        let tampered = line.replace("1", "2");
        assert!(matches!(
            decode_frames::<serde_json::Value>(tampered.as_bytes()).unwrap_err(),
            FrameError::ChecksumMismatch { .. } | FrameError::BadChecksum { .. }
        ));
        let doubled = format!("{line}\n");
        assert_eq!(
            decode_frames::<serde_json::Value>(doubled.as_bytes()).unwrap_err(),
            FrameError::Empty { line: 2 }
        );
    }

    #[test]
    fn test_replay_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        {
            let repo = JournalRepository::open(dir.path()).unwrap();
            repo.insert_atom(&atom("alpha", 1)).unwrap();
            repo.insert_atom(&atom("beta", 2)).unwrap();
            repo.upsert_mpd_node(&MpdNode::new("n", "component", "draft", t0)).unwrap();
            repo.upsert_mpd_node(&MpdNode::new("n", "component", "active", t0 + Duration::hours(1)))
                .unwrap();
            repo.close().unwrap();
        }
        let repo = JournalRepository::open(dir.path()).unwrap();
        assert_eq!(repo.count_atoms().unwrap(), 2);
        assert_eq!(repo.next_creation_key().unwrap(), 3);
        assert_eq!(repo.fetch_atoms(None, 0, Some("topic")).unwrap().len(), 2);
        let history = repo
            .fetch_mpd_nodes(&NodeFilter {
                include_history: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].tt_end, Some(t0 + Duration::hours(1)));
        assert!(repo.integrity().all_ok());
    }

    #[test]
    fn test_version_maps_survive_replay() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        {
            let repo = JournalRepository::open(dir.path()).unwrap();
            // Written out of order; versions come back by tt_start.
            repo.upsert_mpd_node(&MpdNode::new("n", "component", "active", t0 + Duration::hours(3)))
                .unwrap();
            repo.upsert_mpd_node(&MpdNode::new("m", "component", "draft", t0)).unwrap();
            repo.upsert_mpd_node(&MpdNode::new("n", "component", "draft", t0)).unwrap();
            for (source, target) in [("a", "b"), ("ab", "c"), ("b", "a")] {
                repo.write_mpd_edge(&BitemporalEdge::new(source, target, "manager_of", t0)).unwrap();
            }
            repo.close().unwrap();
        }
        let repo = JournalRepository::open(dir.path()).unwrap();
        let versions = repo.fetch_node_versions("n").unwrap();
        assert_eq!(
            versions.iter().map(|n| n.lifecycle.as_str()).collect::<Vec<_>>(),
            vec!["draft", "active"]
        );
        assert_eq!(repo.current_mpd_node("n").unwrap().unwrap().lifecycle, "active");
        assert!(repo.current_mpd_node("ghost").unwrap().is_none());

        let from_a = repo
            .fetch_mpd_edges(&EdgeFilter {
                source: Some("a".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_a[0].target, "b");
        assert_eq!(repo.fetch_edge_versions("b", "a", "manager_of").unwrap().len(), 1);
        assert_eq!(
            repo.fetch_edges_overlapping(TimeAxis::Transaction, t0, t0).unwrap().len(),
            3
        );
    }

    #[test]
    fn test_corrupt_stream_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        {
            let repo = JournalRepository::open(dir.path()).unwrap();
            repo.insert_atom(&atom("alpha", 1)).unwrap();
            repo.upsert_mpd_node(&MpdNode::new("n", "component", "active", Utc::now()))
                .unwrap();
        }
        let atoms_path = dir.path().join(ATOMS_LOG);
        let mut bytes = std::fs::read(&atoms_path).unwrap();
        bytes.truncate(bytes.len() - 3);
        std::fs::write(&atoms_path, bytes).unwrap();

        let err = JournalRepository::open(dir.path()).err().unwrap();
        assert_eq!(err.kind(), "journal_corruption_error");
        match err {
            AimosError::JournalCorruption { quarantined_to, .. } => {
                let dest = quarantined_to.unwrap();
                assert!(dest.exists());
                assert!(dest.starts_with(dir.path().join(QUARANTINE_DIR)));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!atoms_path.exists());
        assert!(dir.path().join(NODES_LOG).exists());

        // The remaining streams load cleanly once the bad journal is gone.
        let repo = JournalRepository::open(dir.path()).unwrap();
        assert_eq!(repo.count_atoms().unwrap(), 0);
        assert_eq!(repo.fetch_mpd_nodes(&NodeFilter::default()).unwrap().len(), 1);
    }
}
