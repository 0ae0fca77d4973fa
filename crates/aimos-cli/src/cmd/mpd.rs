//! MPD registry and bitemporal query commands.

use super::{to_json, Context};
use crate::cli::{MatchMode, MpdCommands};
use aimos_memory::btsm::TrunkDraft;
use aimos_memory::{BitemporalQueryEngine, MpdRegistry};
use aimos_types::canonical::parse_ts;
use aimos_types::mpd::{EdgeFilter, NodeFilter, PolicyMatch};
use aimos_types::{AimosError, AimosResult};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

impl From<MatchMode> for PolicyMatch {
    fn from(mode: MatchMode) -> Self {
        match mode {
            MatchMode::All => PolicyMatch::All,
            MatchMode::Any => PolicyMatch::Any,
        }
    }
}

fn timestamp(raw: &str) -> AimosResult<DateTime<Utc>> {
    parse_ts(raw).map_err(|e| AimosError::validation(format!("invalid timestamp '{raw}': {e}")))
}

pub fn run(ctx: &Context, command: MpdCommands) -> AimosResult<Value> {
    let store = ctx.open_store()?;
    let registry = MpdRegistry::new(store.repository().clone());
    let engine = BitemporalQueryEngine::new(store.repository().clone());

    match command {
        MpdCommands::SeedCore => {
            let inserted = registry.seed_core_nodes()?;
            Ok(json!({ "inserted": inserted }))
        }
        MpdCommands::Nodes {
            lifecycle,
            policies,
            policy_match,
            history,
        } => to_json(&registry.nodes(&NodeFilter {
            lifecycle,
            policy_pack_ids: policies,
            policy_match: policy_match.into(),
            include_history: history,
        })?),
        MpdCommands::Edges {
            relation,
            source,
            target,
            policies,
            policy_match,
            history,
        } => to_json(&registry.edges(&EdgeFilter {
            relation,
            source,
            target,
            policy_pack_ids: policies,
            policy_match: policy_match.into(),
            include_history: history,
        })?),
        MpdCommands::SeedTrunk {
            summary,
            correlation_id,
            policies,
            owners,
        } => {
            let draft = TrunkDraft {
                summary,
                correlation_id,
                policy_pack_ids: policies,
                owners,
            };
            let (nodes, edges) = registry.seed_trunk(&draft)?;
            Ok(json!({ "nodes": nodes, "edges": edges }))
        }
        MpdCommands::BlastRadius {
            roots,
            relations,
            required,
        } => to_json(&registry.calculate_blast_radius(&roots, &relations, &required)?),
        MpdCommands::AsOf { at, time, edges } => {
            to_json(&engine.time_travel(timestamp(&at)?, !time.valid_time, edges)?)
        }
        MpdCommands::History { id, time } => {
            to_json(&engine.query_node_history(&id, !time.valid_time)?)
        }
        MpdCommands::Audit { id, edges } => to_json(&engine.audit_trail(&id, edges)?),
        MpdCommands::Changes { from, to, time } => to_json(&engine.query_changes_between(
            timestamp(&from)?,
            timestamp(&to)?,
            !time.valid_time,
        )?),
    }
}
