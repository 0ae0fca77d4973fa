//! SQLite backend: WAL-mode relational store.

use super::{check_atom, AtomRepository, JournalIntegrity};
use crate::migration::run_migrations;
use aimos_types::atom::{Atom, Snapshot};
use aimos_types::canonical::{format_ts, parse_ts};
use aimos_types::config::Backend;
use aimos_types::mpd::{BitemporalEdge, EdgeFilter, MpdNode, NodeFilter, TimeAxis};
use aimos_types::{AimosError, AimosResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Database file name inside the store directory.
pub const DB_FILE: &str = "cmc.sqlite3";

const ATOM_COLUMNS: &str = "id, creation_key, modality, content, tags, metadata, embedding, policy_tags, hash, created_at, witness";

fn db_err(e: rusqlite::Error) -> AimosError {
    AimosError::Storage(e.to_string())
}

/// Start and end columns of `axis`.
fn axis_columns(axis: TimeAxis) -> (&'static str, &'static str) {
    match axis {
        TimeAxis::Transaction => ("tt_start", "tt_end"),
        TimeAxis::Valid => ("vt_start", "vt_end"),
    }
}

/// `(payload, tt_end)` pairs of the rows selected by `sql`.
fn payload_rows(conn: &Connection, sql: &str, args: &[&dyn ToSql]) -> AimosResult<Vec<(String, Option<String>)>> {
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let rows = stmt
        .query_map(args, |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)))
        .map_err(db_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err)?;
    Ok(rows)
}

fn read_nodes(conn: &Connection, sql: &str, args: &[&dyn ToSql]) -> AimosResult<Vec<MpdNode>> {
    payload_rows(conn, sql, args)?
        .into_iter()
        .map(|(payload, tt_end)| -> AimosResult<MpdNode> {
            let mut node: MpdNode = serde_json::from_str(&payload)?;
            // The column is authoritative: closing a version only touches it.
            node.tt_end = tt_end.as_deref().map(parse_ts).transpose()?;
            Ok(node)
        })
        .collect()
}

fn read_edges(conn: &Connection, sql: &str, args: &[&dyn ToSql]) -> AimosResult<Vec<BitemporalEdge>> {
    payload_rows(conn, sql, args)?
        .into_iter()
        .map(|(payload, tt_end)| -> AimosResult<BitemporalEdge> {
            let mut edge: BitemporalEdge = serde_json::from_str(&payload)?;
            edge.tt_end = tt_end.as_deref().map(parse_ts).transpose()?;
            Ok(edge)
        })
        .collect()
}

/// Relational atom repository.
#[derive(Clone)]
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

/// Raw column values of one `atoms` row.
struct AtomRow {
    id: String,
    creation_key: i64,
    modality: String,
    content: String,
    tags: String,
    metadata: String,
    embedding: Option<Vec<u8>>,
    policy_tags: String,
    hash: String,
    created_at: String,
    witness: String,
}

impl AtomRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            creation_key: row.get(1)?,
            modality: row.get(2)?,
            content: row.get(3)?,
            tags: row.get(4)?,
            metadata: row.get(5)?,
            embedding: row.get(6)?,
            policy_tags: row.get(7)?,
            hash: row.get(8)?,
            created_at: row.get(9)?,
            witness: row.get(10)?,
        })
    }

    fn into_atom(self) -> AimosResult<Atom> {
        let embedding = match self.embedding {
            Some(blob) => Some(
                rmp_serde::from_slice(&blob)
                    .map_err(|e| AimosError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        Ok(Atom {
            id: self.id,
            creation_key: self.creation_key as u64,
            modality: self.modality,
            content: serde_json::from_str(&self.content)?,
            tags: serde_json::from_str(&self.tags)?,
            metadata: serde_json::from_str(&self.metadata)?,
            embedding,
            policy_tags: serde_json::from_str(&self.policy_tags)?,
            hash: self.hash,
            created_at: parse_ts(&self.created_at)?,
            witness: serde_json::from_str(&self.witness)?,
        })
    }
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path, busy_timeout_ms: u64) -> AimosResult<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))
            .map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")
            .map_err(db_err)?;
        run_migrations(&conn).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database (for tests).
    pub fn open_in_memory() -> AimosResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        run_migrations(&conn).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> AimosResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| AimosError::Internal(e.to_string()))
    }

    fn next_key(conn: &Connection) -> AimosResult<u64> {
        let max: i64 = conn
            .query_row("SELECT COALESCE(MAX(creation_key), 0) FROM atoms", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(max as u64 + 1)
    }

    fn snapshot_atom_ids(conn: &Connection, snapshot_id: &str) -> AimosResult<Vec<String>> {
        let mut stmt = conn
            .prepare("SELECT atom_id FROM snapshot_atoms WHERE snapshot_id = ?1 ORDER BY position")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![snapshot_id], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn read_snapshots(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> AimosResult<Vec<Snapshot>> {
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(args, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for (id, created_at, previous_id, note, stats, witness) in rows {
            let atom_ids = Self::snapshot_atom_ids(conn, &id)?;
            snapshots.push(Snapshot {
                id,
                created_at: parse_ts(&created_at)?,
                atom_ids,
                previous_id,
                note,
                stats: serde_json::from_str(&stats)?,
                witness: serde_json::from_str(&witness)?,
            });
        }
        Ok(snapshots)
    }

    fn close_open_node_rows(tx: &Transaction<'_>, node: &MpdNode) -> AimosResult<()> {
        let start = format_ts(&node.tt_start);
        let closed = tx
            .execute(
                "UPDATE mpd_nodes SET tt_end = ?1 WHERE mpd_id = ?2 AND tt_end IS NULL AND tt_start < ?1",
                params![start, node.mpd_id],
            )
            .map_err(db_err)?;
        if closed > 0 {
            debug!(mpd_id = %node.mpd_id, closed, "Closed previous node versions");
        }
        Ok(())
    }
}

impl AtomRepository for SqliteRepository {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    fn next_creation_key(&self) -> AimosResult<u64> {
        let conn = self.lock()?;
        Self::next_key(&conn)
    }

    fn insert_atom(&self, atom: &Atom) -> AimosResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let exists: Option<String> = tx
            .query_row("SELECT id FROM atoms WHERE id = ?1", params![atom.id], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        if exists.is_some() {
            atom.verify_identity()?;
            return Ok(());
        }
        check_atom(atom, Self::next_key(&tx)?)?;

        let embedding = match &atom.embedding {
            Some(values) => Some(
                rmp_serde::to_vec(values).map_err(|e| AimosError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        tx.execute(
            &format!("INSERT INTO atoms ({ATOM_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
            params![
                atom.id,
                atom.creation_key as i64,
                atom.modality,
                serde_json::to_string(&atom.content)?,
                serde_json::to_string(&atom.tags)?,
                serde_json::to_string(&atom.metadata)?,
                embedding,
                serde_json::to_string(&atom.policy_tags)?,
                atom.hash,
                format_ts(&atom.created_at),
                serde_json::to_string(&atom.witness)?,
            ],
        )
        .map_err(db_err)?;
        for (tag, weight) in &atom.tags {
            tx.execute(
                "INSERT INTO atom_tags (atom_id, tag, weight) VALUES (?1, ?2, ?3)",
                params![atom.id, tag, weight],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn fetch_atoms(&self, limit: Option<usize>, offset: usize, tag: Option<&str>) -> AimosResult<Vec<Atom>> {
        let conn = self.lock()?;
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map_or(-1, |l| l as i64);
        let rows = match tag {
            Some(tag) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {ATOM_COLUMNS} FROM atoms WHERE id IN (SELECT atom_id FROM atom_tags WHERE tag = ?1)
                         ORDER BY creation_key LIMIT ?2 OFFSET ?3"
                    ))
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![tag, limit, offset as i64], AtomRow::read)
                    .map_err(db_err)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(db_err)?
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {ATOM_COLUMNS} FROM atoms ORDER BY creation_key LIMIT ?1 OFFSET ?2"
                    ))
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![limit, offset as i64], AtomRow::read)
                    .map_err(db_err)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(db_err)?
            }
        };
        rows.into_iter().map(AtomRow::into_atom).collect()
    }

    fn get_atom(&self, id: &str) -> AimosResult<Option<Atom>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {ATOM_COLUMNS} FROM atoms WHERE id = ?1"),
                params![id],
                AtomRow::read,
            )
            .optional()
            .map_err(db_err)?;
        row.map(AtomRow::into_atom).transpose()
    }

    fn count_atoms(&self) -> AimosResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM atoms", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(count as u64)
    }

    fn insert_snapshot(&self, snapshot: &Snapshot) -> AimosResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO snapshots (id, created_at, previous_id, note, stats, witness)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    snapshot.id,
                    format_ts(&snapshot.created_at),
                    snapshot.previous_id,
                    snapshot.note,
                    serde_json::to_string(&snapshot.stats)?,
                    serde_json::to_string(&snapshot.witness)?,
                ],
            )
            .map_err(db_err)?;
        if inserted == 0 {
            return Ok(());
        }
        for (position, atom_id) in snapshot.atom_ids.iter().enumerate() {
            tx.execute(
                "INSERT INTO snapshot_atoms (snapshot_id, position, atom_id) VALUES (?1, ?2, ?3)",
                params![snapshot.id, position as i64, atom_id],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn fetch_snapshots(&self) -> AimosResult<Vec<Snapshot>> {
        let conn = self.lock()?;
        Self::read_snapshots(
            &conn,
            "SELECT id, created_at, previous_id, note, stats, witness FROM snapshots ORDER BY seq",
            &[],
        )
    }

    fn fetch_snapshot(&self, id: &str) -> AimosResult<Option<Snapshot>> {
        let conn = self.lock()?;
        let mut found = Self::read_snapshots(
            &conn,
            "SELECT id, created_at, previous_id, note, stats, witness FROM snapshots WHERE id = ?1",
            &[&id],
        )?;
        Ok(found.pop())
    }

    fn latest_snapshot(&self) -> AimosResult<Option<Snapshot>> {
        let conn = self.lock()?;
        let mut found = Self::read_snapshots(
            &conn,
            "SELECT id, created_at, previous_id, note, stats, witness FROM snapshots ORDER BY seq DESC LIMIT 1",
            &[],
        )?;
        Ok(found.pop())
    }

    fn write_mpd_node(&self, node: &MpdNode) -> AimosResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let start = format_ts(&node.tt_start);
        let exists: Option<String> = tx
            .query_row(
                "SELECT mpd_id FROM mpd_nodes WHERE mpd_id = ?1 AND tt_start = ?2",
                params![node.mpd_id, start],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if exists.is_none() {
            Self::close_open_node_rows(&tx, node)?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO mpd_nodes (mpd_id, tt_start, tt_end, vt_start, vt_end, lifecycle, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                node.mpd_id,
                start,
                node.tt_end.as_ref().map(format_ts),
                format_ts(&node.vt_start),
                node.vt_end.as_ref().map(format_ts),
                node.lifecycle,
                serde_json::to_string(node)?,
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn fetch_mpd_nodes(&self, filter: &NodeFilter) -> AimosResult<Vec<MpdNode>> {
        let conn = self.lock()?;
        let mut sql = String::from("SELECT payload, tt_end FROM mpd_nodes WHERE 1 = 1");
        let mut args: Vec<&dyn ToSql> = Vec::new();
        if !filter.include_history {
            sql.push_str(" AND tt_end IS NULL");
        }
        if let Some(lifecycle) = &filter.lifecycle {
            args.push(lifecycle);
            sql.push_str(&format!(" AND lifecycle = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY mpd_id, tt_start");
        Ok(read_nodes(&conn, &sql, &args)?
            .into_iter()
            .filter(|node| filter.matches(node))
            .collect())
    }

    fn fetch_node_versions(&self, mpd_id: &str) -> AimosResult<Vec<MpdNode>> {
        let conn = self.lock()?;
        read_nodes(
            &conn,
            "SELECT payload, tt_end FROM mpd_nodes WHERE mpd_id = ?1 ORDER BY tt_start",
            &[&mpd_id],
        )
    }

    fn current_mpd_node(&self, mpd_id: &str) -> AimosResult<Option<MpdNode>> {
        let conn = self.lock()?;
        let mut found = read_nodes(
            &conn,
            "SELECT payload, tt_end FROM mpd_nodes WHERE mpd_id = ?1 AND tt_end IS NULL
             ORDER BY tt_start DESC LIMIT 1",
            &[&mpd_id],
        )?;
        Ok(found.pop())
    }

    fn fetch_nodes_overlapping(
        &self,
        axis: TimeAxis,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AimosResult<Vec<MpdNode>> {
        let conn = self.lock()?;
        let (start, end) = axis_columns(axis);
        let sql = format!(
            "SELECT payload, tt_end FROM mpd_nodes
             WHERE {start} <= ?1 AND ({end} IS NULL OR {end} >= ?2)
             ORDER BY mpd_id, tt_start"
        );
        read_nodes(&conn, &sql, &[&format_ts(&to), &format_ts(&from)])
    }

    fn write_mpd_edge(&self, edge: &BitemporalEdge) -> AimosResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let start = format_ts(&edge.tt_start);
        let exists: Option<String> = tx
            .query_row(
                "SELECT source FROM mpd_edges WHERE source = ?1 AND target = ?2 AND relation = ?3 AND tt_start = ?4",
                params![edge.source, edge.target, edge.relation, start],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if exists.is_none() {
            tx.execute(
                "UPDATE mpd_edges SET tt_end = ?1
                 WHERE source = ?2 AND target = ?3 AND relation = ?4 AND tt_end IS NULL AND tt_start < ?1",
                params![start, edge.source, edge.target, edge.relation],
            )
            .map_err(db_err)?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO mpd_edges (source, target, relation, tt_start, tt_end, vt_start, vt_end, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                edge.source,
                edge.target,
                edge.relation,
                start,
                edge.tt_end.as_ref().map(format_ts),
                format_ts(&edge.vt_start),
                edge.vt_end.as_ref().map(format_ts),
                serde_json::to_string(edge)?,
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn fetch_mpd_edges(&self, filter: &EdgeFilter) -> AimosResult<Vec<BitemporalEdge>> {
        let conn = self.lock()?;
        let mut sql = String::from("SELECT payload, tt_end FROM mpd_edges WHERE 1 = 1");
        let mut args: Vec<&dyn ToSql> = Vec::new();
        if !filter.include_history {
            sql.push_str(" AND tt_end IS NULL");
        }
        if let Some(relation) = &filter.relation {
            args.push(relation);
            sql.push_str(&format!(" AND relation = ?{}", args.len()));
        }
        if let Some(source) = &filter.source {
            args.push(source);
            sql.push_str(&format!(" AND source = ?{}", args.len()));
        }
        if let Some(target) = &filter.target {
            args.push(target);
            sql.push_str(&format!(" AND target = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY source, target, relation, tt_start");
        Ok(read_edges(&conn, &sql, &args)?
            .into_iter()
            .filter(|edge| filter.matches(edge))
            .collect())
    }

    fn fetch_edge_versions(&self, source: &str, target: &str, relation: &str) -> AimosResult<Vec<BitemporalEdge>> {
        let conn = self.lock()?;
        read_edges(
            &conn,
            "SELECT payload, tt_end FROM mpd_edges
             WHERE source = ?1 AND target = ?2 AND relation = ?3 ORDER BY tt_start",
            &[&source, &target, &relation],
        )
    }

    fn fetch_edges_overlapping(
        &self,
        axis: TimeAxis,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AimosResult<Vec<BitemporalEdge>> {
        let conn = self.lock()?;
        let (start, end) = axis_columns(axis);
        let sql = format!(
            "SELECT payload, tt_end FROM mpd_edges
             WHERE {start} <= ?1 AND ({end} IS NULL OR {end} >= ?2)
             ORDER BY source, target, relation, tt_start"
        );
        read_edges(&conn, &sql, &[&format_ts(&to), &format_ts(&from)])
    }

    fn integrity(&self) -> JournalIntegrity {
        JournalIntegrity::HEALTHY
    }

    fn close(&self) -> AimosResult<()> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .map_err(db_err)?;
        Ok(())
    }
}
