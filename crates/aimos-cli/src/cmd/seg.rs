//! Evidence graph commands over an export file.
//!
//! Each invocation loads the graph, applies one operation and writes the
//! export back when the graph changed.

use super::{to_json, Context};
use crate::cli::SegCommands;
use aimos_seg::{SegExport, SegGraph};
use aimos_types::seg::{Entity, Evidence, Relation, RelationKind};
use aimos_types::{AimosError, AimosResult};
use chrono::Utc;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

fn load(path: &Path) -> AimosResult<SegGraph> {
    if !path.exists() {
        return SegGraph::import(SegExport::default());
    }
    let raw = std::fs::read_to_string(path)?;
    let data: SegExport = serde_json::from_str(&raw)?;
    SegGraph::import(data)
}

fn save(graph: &SegGraph, path: &Path) -> AimosResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(&graph.export())?;
    std::fs::write(path, text)?;
    info!(path = %path.display(), "Graph saved");
    Ok(())
}

fn parse_kind(raw: &str) -> AimosResult<RelationKind> {
    let normalized = raw.trim().to_uppercase().replace('-', "_");
    serde_json::from_value(json!(normalized))
        .map_err(|_| AimosError::validation(format!("unknown relation kind '{raw}'")))
}

pub fn run(ctx: &Context, command: SegCommands) -> AimosResult<Value> {
    match command {
        SegCommands::Stats { graph } => to_json(&load(&graph)?.stats()),
        SegCommands::AddEntity {
            graph: path,
            id,
            entity_type,
            name,
        } => {
            let graph = load(&path)?;
            let entity = graph.add_entity(Entity::new(id, entity_type, name, Utc::now()))?;
            save(&graph, &path)?;
            to_json(&entity)
        }
        SegCommands::Relate {
            graph: path,
            source,
            target,
            kind,
            confidence,
        } => {
            let graph = load(&path)?;
            let mut relation = Relation::new("", source, target, parse_kind(&kind)?, Utc::now());
            relation.confidence = confidence;
            let relation = graph.add_relation(relation)?;
            save(&graph, &path)?;
            to_json(&relation)
        }
        SegCommands::AddEvidence {
            graph: path,
            content,
            source,
            atom,
        } => {
            let mut graph = load(&path)?;
            if atom.is_some() {
                graph = graph.with_catalog(Arc::new(ctx.open_store()?));
            }
            let mut evidence = Evidence::new("", content, source, Utc::now());
            evidence.atom_id = atom;
            let evidence = graph.add_evidence(evidence)?;
            save(&graph, &path)?;
            to_json(&evidence)
        }
        SegCommands::Trace { graph, id, depth } => {
            let graph = load(&graph)?;
            if graph.get_entity(&id, None).is_none() {
                return Err(AimosError::NotFound(format!("entity {id}")));
            }
            let trail: Vec<Value> = graph
                .trace_provenance(&id, depth)
                .into_iter()
                .map(|(entity, relation)| json!({ "entity": entity, "relation": relation }))
                .collect();
            Ok(json!({ "id": id, "provenance": trail }))
        }
        SegCommands::Contradictions { graph: path } => {
            let graph = load(&path)?;
            let found = graph.detect_contradictions();
            save(&graph, &path)?;
            to_json(&found)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aimos_types::config::{AimosConfig, Backend};

    fn context(dir: &Path) -> Context {
        let mut config = AimosConfig::default();
        config.store.dir = dir.join("store");
        config.store.backend = Backend::Jsonl;
        Context { config }
    }

    fn add(ctx: &Context, graph: &Path, id: &str) {
        run(
            ctx,
            SegCommands::AddEntity {
                graph: graph.to_path_buf(),
                id: id.into(),
                entity_type: "claim".into(),
                name: id.into(),
            },
        )
        .unwrap();
    }

    #[test]
    fn test_graph_file_round_trips_commands() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let graph = dir.path().join("graphs").join("seg.json");
        add(&ctx, &graph, "a");
        add(&ctx, &graph, "b");
        for (source, target, kind) in [("a", "b", "contradicts"), ("a", "b", "derives-from")] {
            run(
                &ctx,
                SegCommands::Relate {
                    graph: graph.clone(),
                    source: source.into(),
                    target: target.into(),
                    kind: kind.into(),
                    confidence: 0.7,
                },
            )
            .unwrap();
        }

        let found = run(&ctx, SegCommands::Contradictions { graph: graph.clone() }).unwrap();
        assert_eq!(found.as_array().unwrap().len(), 1);

        let trail = run(
            &ctx,
            SegCommands::Trace {
                graph: graph.clone(),
                id: "b".into(),
                depth: 5,
            },
        )
        .unwrap();
        assert_eq!(trail["provenance"][0]["entity"]["id"], json!("a"));

        let stats = run(&ctx, SegCommands::Stats { graph }).unwrap();
        assert_eq!(stats["entity_count"], json!(2));
        assert_eq!(stats["relation_count"], json!(2));
        assert_eq!(stats["contradiction_count"], json!(1));
    }

    #[test]
    fn test_relation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let graph = dir.path().join("seg.json");
        add(&ctx, &graph, "a");
        let relate = |target: &str, kind: &str| {
            run(
                &ctx,
                SegCommands::Relate {
                    graph: graph.clone(),
                    source: "a".into(),
                    target: target.into(),
                    kind: kind.into(),
                    confidence: 1.0,
                },
            )
        };
        assert_eq!(relate("a", "befriends").unwrap_err().kind(), "validation_error");
        assert_eq!(relate("ghost", "supports").unwrap_err().kind(), "validation_error");
    }

    #[test]
    fn test_evidence_checks_atom_against_store() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let graph = dir.path().join("seg.json");
        let atom = ctx
            .open_store()
            .unwrap()
            .create_atom(aimos_types::atom::AtomCreate::text("text", "observed"), None)
            .unwrap();

        let evidence = |atom: Option<String>| {
            run(
                &ctx,
                SegCommands::AddEvidence {
                    graph: graph.clone(),
                    content: "observation".into(),
                    source: "sensor".into(),
                    atom,
                },
            )
        };
        let ok = evidence(Some(atom.id.clone())).unwrap();
        assert_eq!(ok["atom_id"], json!(atom.id));
        assert_eq!(
            evidence(Some("missing".into())).unwrap_err().kind(),
            "validation_error"
        );
    }
}
