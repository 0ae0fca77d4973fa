//! SQLite schema creation and migration.
//!
//! Creates every table the relational backend needs on first open.

use rusqlite::Connection;

/// Current schema version.
const SCHEMA_VERSION: u32 = 3;

/// Run all migrations to bring the database up to date.
pub fn run_migrations(conn: &Connection) -> Result<(), rusqlite::Error> {
    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    if current_version < 3 {
        migrate_v3(conn)?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Get the current schema version from the database.
pub fn get_schema_version(conn: &Connection) -> u32 {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "user_version", version)
}

/// Version 1: atoms, tags and snapshots.
fn migrate_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS atoms (
            id TEXT PRIMARY KEY,
            creation_key INTEGER NOT NULL UNIQUE,
            modality TEXT NOT NULL,
            content TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '{}',
            metadata TEXT NOT NULL DEFAULT '{}',
            embedding BLOB,
            policy_tags TEXT NOT NULL DEFAULT '[]',
            hash TEXT NOT NULL,
            created_at TEXT NOT NULL,
            witness TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_atoms_creation_key ON atoms(creation_key);

        CREATE TABLE IF NOT EXISTS atom_tags (
            atom_id TEXT NOT NULL,
            tag TEXT NOT NULL,
            weight REAL NOT NULL,
            PRIMARY KEY (atom_id, tag),
            FOREIGN KEY (atom_id) REFERENCES atoms(id)
        );
        CREATE INDEX IF NOT EXISTS idx_atom_tags_tag ON atom_tags(tag);

        CREATE TABLE IF NOT EXISTS snapshots (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            previous_id TEXT,
            note TEXT,
            stats TEXT NOT NULL DEFAULT '{}',
            witness TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS snapshot_atoms (
            snapshot_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            atom_id TEXT NOT NULL,
            PRIMARY KEY (snapshot_id, position),
            FOREIGN KEY (snapshot_id) REFERENCES snapshots(id)
        );
        ",
    )?;
    Ok(())
}

/// Version 2: bitemporal MPD registry.
fn migrate_v2(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS mpd_nodes (
            mpd_id TEXT NOT NULL,
            tt_start TEXT NOT NULL,
            tt_end TEXT,
            vt_start TEXT NOT NULL,
            vt_end TEXT,
            lifecycle TEXT NOT NULL,
            payload TEXT NOT NULL,
            PRIMARY KEY (mpd_id, tt_start)
        );
        CREATE INDEX IF NOT EXISTS idx_mpd_nodes_vt ON mpd_nodes(mpd_id, vt_start);
        CREATE INDEX IF NOT EXISTS idx_mpd_nodes_open ON mpd_nodes(tt_end);

        CREATE TABLE IF NOT EXISTS mpd_edges (
            source TEXT NOT NULL,
            target TEXT NOT NULL,
            relation TEXT NOT NULL,
            tt_start TEXT NOT NULL,
            tt_end TEXT,
            vt_start TEXT NOT NULL,
            vt_end TEXT,
            payload TEXT NOT NULL,
            PRIMARY KEY (source, target, relation, tt_start)
        );
        CREATE INDEX IF NOT EXISTS idx_mpd_edges_source ON mpd_edges(source);
        CREATE INDEX IF NOT EXISTS idx_mpd_edges_target ON mpd_edges(target);
        ",
    )?;
    Ok(())
}

/// Version 3: time-axis indexes for as-of, range and change queries.
fn migrate_v3(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_mpd_nodes_tt_start ON mpd_nodes(tt_start);
        CREATE INDEX IF NOT EXISTS idx_mpd_nodes_vt_start ON mpd_nodes(vt_start);
        CREATE INDEX IF NOT EXISTS idx_mpd_edges_tt_start ON mpd_edges(tt_start);
        CREATE INDEX IF NOT EXISTS idx_mpd_edges_vt_start ON mpd_edges(vt_start);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_create_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        for table in ["atoms", "atom_tags", "snapshots", "snapshot_atoms", "mpd_nodes", "mpd_edges"] {
            assert!(tables.iter().any(|t| t == table), "missing table {table}");
        }
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
    }

    #[test]
    fn test_bitemporal_lookups_are_indexed() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let indexes: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='index'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        for index in [
            "idx_mpd_nodes_tt_start",
            "idx_mpd_nodes_vt_start",
            "idx_mpd_edges_tt_start",
            "idx_mpd_edges_vt_start",
        ] {
            assert!(indexes.iter().any(|i| i == index), "missing index {index}");
        }

        let plan: Vec<String> = conn
            .prepare("EXPLAIN QUERY PLAN SELECT payload FROM mpd_nodes WHERE mpd_id = ?1 ORDER BY tt_start")
            .unwrap()
            .query_map(["n"], |row| row.get(3))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert!(plan.iter().any(|step| step.starts_with("SEARCH")), "{plan:?}");
    }
}
