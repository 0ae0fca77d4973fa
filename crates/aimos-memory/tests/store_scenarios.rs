//! End-to-end store scenarios run against both repository backends.

use std::sync::Arc;

use aimos_memory::btsm::{MpdRegistry, CORE_NODE};
use aimos_memory::{BitemporalQueryEngine, MemoryStore, MetricsRegistry};
use aimos_types::atom::AtomCreate;
use aimos_types::config::{Backend, StoreConfig};
use aimos_types::mpd::{MpdNode, NodeFilter};
use chrono::{Duration, TimeZone, Utc};

const BACKENDS: [Backend; 2] = [Backend::Sqlite, Backend::Jsonl];

fn open(dir: &std::path::Path, backend: Backend) -> MemoryStore {
    MemoryStore::open(StoreConfig::at(dir, backend))
        .unwrap()
        .with_metrics(Arc::new(MetricsRegistry::new()))
}

#[test]
fn snapshot_id_survives_reopen() {
    for backend in BACKENDS {
        let dir = tempfile::tempdir().unwrap();
        let first = {
            let store = open(dir.path(), backend);
            for text in ["alpha", "beta", "gamma"] {
                store.create_atom(AtomCreate::text("text", text), None).unwrap();
            }
            let snapshot = store.create_snapshot(Some("baseline"), None).unwrap();
            store.close().unwrap();
            snapshot
        };

        let store = open(dir.path(), backend);
        let second = store.create_snapshot(Some("baseline"), None).unwrap();
        assert_eq!(first.id, second.id, "backend {backend}");
        assert_eq!(second.atom_ids.len(), 3);

        let replayed = store.replay_snapshot(&second.id).unwrap();
        let texts: Vec<_> = replayed.iter().filter_map(|a| a.text()).collect();
        assert_eq!(texts, vec!["alpha", "beta", "gamma"]);
    }
}

#[test]
fn fresh_store_reproduces_snapshot_id() {
    let ids: Vec<String> = BACKENDS
        .iter()
        .map(|backend| {
            let dir = tempfile::tempdir().unwrap();
            let store = open(dir.path(), *backend);
            for text in ["alpha", "beta", "gamma"] {
                store.create_atom(AtomCreate::text("text", text), None).unwrap();
            }
            store.create_snapshot(Some("baseline"), None).unwrap().id
        })
        .collect();
    assert_eq!(ids[0], ids[1]);
}

#[test]
fn bitemporal_seed_node_closes() {
    let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let t1 = t0 + Duration::days(30);
    for backend in BACKENDS {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), backend);
        let repo = store.repository().clone();
        let engine = BitemporalQueryEngine::new(repo.clone());

        let mut node = MpdNode::new(CORE_NODE, "platform", "active", t0);
        repo.upsert_mpd_node(&node).unwrap();
        let present = engine.query_nodes_as_of(t0 + Duration::seconds(1), true).unwrap();
        assert_eq!(present.len(), 1, "backend {backend}");

        node.tt_end = Some(t1);
        repo.upsert_mpd_node(&node).unwrap();
        assert!(engine
            .query_nodes_as_of(t1 + Duration::seconds(1), true)
            .unwrap()
            .is_empty());
        let history = engine.query_node_history(CORE_NODE, true).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].tt_end, Some(t1));
    }
}

#[test]
fn status_and_integrity_report_backend_state() {
    for backend in BACKENDS {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), backend);
        store
            .create_atom(AtomCreate::text("text", "status check").with_tag("ops", 0.4), None)
            .unwrap();
        let snapshot = store.create_snapshot(None, None).unwrap();

        let status = store.status_summary().unwrap();
        assert_eq!(status.backend, backend);
        assert_eq!(status.atom_count, 1);
        assert_eq!(status.snapshot_count, 1);
        assert_eq!(status.latest_snapshot_id.as_deref(), Some(snapshot.id.as_str()));
        assert_eq!(status.metrics.atoms_created, 1);
        assert!(store.journal_integrity().all_ok());
    }
}

#[test]
fn core_registry_persists_across_reopen() {
    for backend in BACKENDS {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path(), backend);
            MpdRegistry::new(store.repository().clone())
                .seed_core_nodes()
                .unwrap();
            store.close().unwrap();
        }
        let store = open(dir.path(), backend);
        let registry = MpdRegistry::new(store.repository().clone());
        assert_eq!(registry.seed_core_nodes().unwrap(), 0);
        assert_eq!(registry.nodes(&NodeFilter::default()).unwrap().len(), 3);
        let radius = registry
            .calculate_blast_radius(&[CORE_NODE.to_string()], &[], &[])
            .unwrap();
        assert!(radius.compliant);
    }
}
