//! Store commands: status, integrity, atoms and snapshots.

use super::{block_on, to_json, Context};
use crate::cli::{AtomCommands, SnapshotCommands};
use aimos_types::atom::AtomCreate;
use aimos_types::{AimosError, AimosResult};
use serde_json::{json, Value};
use uuid::Uuid;

pub fn status(ctx: &Context) -> AimosResult<Value> {
    let store = ctx.open_store()?;
    to_json(&store.status_summary()?)
}

pub fn integrity(ctx: &Context) -> AimosResult<Value> {
    let store = ctx.open_store()?;
    let report = store.journal_integrity();
    Ok(json!({
        "backend": store.config().backend,
        "ok": report.all_ok(),
        "streams": report,
    }))
}

pub fn atom(ctx: &Context, command: AtomCommands) -> AimosResult<Value> {
    let store = ctx.open_store()?;
    match command {
        AtomCommands::Add {
            text,
            modality,
            tags,
            correlation_id,
            index,
        } => {
            let correlation_id = correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let mut input = AtomCreate::text(modality, text);
            for (key, weight) in tags {
                input = input.with_tag(key, weight);
            }
            let providers = ctx.providers();
            let hhni = ctx.index(&providers);
            let (atom, nodes) = block_on(store.create_atom_with_hhni(
                input,
                index,
                Some(&correlation_id),
                &hhni,
            ))??;
            Ok(json!({
                "atom": atom,
                "correlation_id": correlation_id,
                "indexed_nodes": nodes.len(),
            }))
        }
        AtomCommands::List { limit, offset, tag } => {
            to_json(&store.list_atoms(limit, offset, tag.as_deref())?)
        }
        AtomCommands::Get { id } => {
            let atom = store
                .get_atom(&id)?
                .ok_or_else(|| AimosError::NotFound(format!("atom {id}")))?;
            to_json(&atom)
        }
    }
}

pub fn snapshot(ctx: &Context, command: SnapshotCommands) -> AimosResult<Value> {
    let store = ctx.open_store()?;
    match command {
        SnapshotCommands::Create {
            note,
            correlation_id,
        } => {
            let correlation_id = correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            to_json(&store.create_snapshot(note.as_deref(), Some(&correlation_id))?)
        }
        SnapshotCommands::List => to_json(&store.list_snapshots()?),
        SnapshotCommands::Replay { id } => to_json(&store.replay_snapshot(&id)?),
    }
}
