//! MPD registry operations: core seeding, trunk drafting and blast radius.

use crate::repository::AtomRepository;
use aimos_types::mpd::{
    BitemporalEdge, EdgeFilter, KpiReference, MpdNode, NodeFilter, DEPENDS_ON, MANAGER_OF,
};
use aimos_types::{AimosError, AimosResult};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::info;

pub const CORE_NODE: &str = "aimos.cmc";
pub const CORE_SQLITE_NODE: &str = "aimos.cmc.sqlite";
pub const CORE_SEG_NODE: &str = "aimos.cmc.seg";
pub const TRUNK_NODE: &str = "aimos.mige.trunk";
pub const GUARDRAILS_NODE: &str = "aimos.mige.trunk.guardrails";

const DEFAULT_POLICY: &str = "policy.mige.default";
const GUARDRAILS_POLICY: &str = "policy.mige.guardrails";
const CORE_POLICY: &str = "policy.cmc.default";
const DEFAULT_OWNER: &str = "aimos-core";
const PURPOSE_LIMIT: usize = 350;

/// Kind of a blast-radius finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    MissingNode,
    NodePolicy,
    EdgePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub subject_id: String,
    pub message: String,
    /// Packs the subject actually carries.
    pub policy_pack_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraversedEdge {
    pub source: String,
    pub target: String,
    pub relation: String,
    pub policy_pack_ids: Vec<String>,
}

/// Result of [`MpdRegistry::calculate_blast_radius`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlastRadius {
    pub root_ids: Vec<String>,
    pub required_policy_pack_ids: Vec<String>,
    /// Sorted.
    pub impacted_nodes: Vec<String>,
    pub traversed_edges: Vec<TraversedEdge>,
    pub violations: Vec<Violation>,
    pub compliant: bool,
}

/// Caller input for trunk drafting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrunkDraft {
    pub summary: String,
    pub correlation_id: Option<String>,
    pub policy_pack_ids: Vec<String>,
    pub owners: Vec<String>,
}

/// Registry facade over the MPD streams of a repository.
pub struct MpdRegistry {
    repo: Arc<dyn AtomRepository>,
}

fn baseline() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Trimmed, non-empty, first occurrence wins.
fn unique(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = Vec::new();
    for item in items {
        let item = item.trim().to_string();
        if !item.is_empty() && !seen.contains(&item) {
            seen.push(item);
        }
    }
    seen
}

fn core_nodes() -> Vec<MpdNode> {
    let at = baseline();
    let mut cmc = MpdNode::new(CORE_NODE, "platform", "active", at);
    cmc.purpose = "Context Memory Core: atom ingestion, snapshots and replay.".into();
    cmc.capabilities = strings(&["memory-ingest", "snapshot-index"]);
    cmc.manager_of = strings(&[CORE_SQLITE_NODE, CORE_SEG_NODE]);
    cmc.policy_pack_ids = strings(&[CORE_POLICY, DEFAULT_POLICY]);
    cmc.owners = strings(&[DEFAULT_OWNER]);
    cmc.kpis = vec![KpiReference {
        name: "CMC_Snapshot_SLA".into(),
        target: 0.99,
        unit: None,
    }];
    cmc.links = BTreeMap::from([("docs".to_string(), "docs/cmc.md".to_string())]);
    cmc.max_dependency_degree = 6;

    let mut sqlite = MpdNode::new(CORE_SQLITE_NODE, "service", "active", at);
    sqlite.purpose = "Durable relational persistence for the memory core.".into();
    sqlite.capabilities = strings(&["bitemporal-storage", "wal-checkpoint"]);
    sqlite.depends_on = strings(&[CORE_NODE]);
    sqlite.policy_pack_ids = strings(&[CORE_POLICY, DEFAULT_POLICY, "policy.db.backup"]);
    sqlite.owners = strings(&[DEFAULT_OWNER]);
    sqlite.links = BTreeMap::from([("docs".to_string(), "docs/cmc_storage.md".to_string())]);
    sqlite.max_dependency_degree = 3;

    let mut seg = MpdNode::new(CORE_SEG_NODE, "service", "active", at);
    seg.purpose = "Evidence graph interface for provenance and replay.".into();
    seg.capabilities = strings(&["seg-witness", "lineage-api"]);
    seg.depends_on = strings(&[CORE_NODE]);
    seg.policy_pack_ids = strings(&[CORE_POLICY, DEFAULT_POLICY, "policy.seg.default"]);
    seg.owners = strings(&[DEFAULT_OWNER]);
    seg.links = BTreeMap::from([("docs".to_string(), "docs/seg.md".to_string())]);
    seg.max_dependency_degree = 4;

    vec![cmc, sqlite, seg]
}

fn core_edges() -> Vec<BitemporalEdge> {
    let at = baseline();
    let core = strings(&[CORE_POLICY, DEFAULT_POLICY]);
    vec![
        BitemporalEdge::new(CORE_NODE, CORE_SQLITE_NODE, MANAGER_OF, at).with_policies(core.clone()),
        BitemporalEdge::new(CORE_NODE, CORE_SEG_NODE, MANAGER_OF, at).with_policies(core),
        BitemporalEdge::new(CORE_SQLITE_NODE, CORE_NODE, DEPENDS_ON, at).with_policies(strings(&[
            CORE_POLICY,
            DEFAULT_POLICY,
            "policy.db.backup",
        ])),
        BitemporalEdge::new(CORE_SEG_NODE, CORE_NODE, DEPENDS_ON, at).with_policies(strings(&[
            CORE_POLICY,
            DEFAULT_POLICY,
            "policy.seg.default",
        ])),
    ]
}

/// `depends_on` edges declared by `nodes`, carrying each node's packs.
pub fn depends_on_edges(nodes: &[MpdNode]) -> Vec<BitemporalEdge> {
    nodes
        .iter()
        .flat_map(|node| {
            node.depends_on.iter().map(move |target| BitemporalEdge {
                source: node.mpd_id.clone(),
                target: target.clone(),
                relation: DEPENDS_ON.to_string(),
                policy_pack_ids: node.policy_pack_ids.clone(),
                witness: node.witness.clone(),
                tt_start: node.tt_start,
                tt_end: node.tt_end,
                vt_start: node.vt_start,
                vt_end: node.vt_end,
            })
        })
        .collect()
}

impl MpdRegistry {
    pub fn new(repo: Arc<dyn AtomRepository>) -> Self {
        Self { repo }
    }

    pub fn nodes(&self, filter: &NodeFilter) -> AimosResult<Vec<MpdNode>> {
        self.repo.fetch_mpd_nodes(filter)
    }

    pub fn edges(&self, filter: &EdgeFilter) -> AimosResult<Vec<BitemporalEdge>> {
        self.repo.fetch_mpd_edges(filter)
    }

    /// Insert the core nodes and their edges unless already present.
    /// Returns how many rows were written.
    pub fn seed_core_nodes(&self) -> AimosResult<usize> {
        let existing: HashSet<String> = self
            .repo
            .fetch_mpd_nodes(&NodeFilter::default())?
            .into_iter()
            .map(|n| n.mpd_id)
            .collect();
        let mut written = 0;
        for node in core_nodes().iter().filter(|n| !existing.contains(&n.mpd_id)) {
            self.repo.upsert_mpd_node(node)?;
            written += 1;
        }

        let open_edges = self.repo.fetch_mpd_edges(&EdgeFilter::default())?;
        for edge in core_edges() {
            if open_edges.iter().any(|e| e.key() == edge.key()) {
                continue;
            }
            self.repo.upsert_mpd_edge(edge)?;
            written += 1;
        }
        if written > 0 {
            info!(written, "Seeded core MPD nodes");
        }
        Ok(written)
    }

    /// Draft the trunk program node and its guardrail control node.
    pub fn draft_trunk_nodes(draft: &TrunkDraft, at: DateTime<Utc>) -> Vec<MpdNode> {
        let owners = if draft.owners.is_empty() {
            vec![DEFAULT_OWNER.to_string()]
        } else {
            unique(draft.owners.iter().cloned())
        };
        let root_policies = unique(
            std::iter::once(DEFAULT_POLICY.to_string()).chain(draft.policy_pack_ids.iter().cloned()),
        );
        let guardrail_policies = unique(
            root_policies
                .iter()
                .cloned()
                .chain(std::iter::once(GUARDRAILS_POLICY.to_string())),
        );
        let witness = |plan: &str| {
            draft
                .correlation_id
                .as_ref()
                .map(|cid| format!("seg://plan/{plan}/{cid}"))
        };

        let mut trunk = MpdNode::new(TRUNK_NODE, "program", "draft", at);
        let summary: String = draft.summary.chars().take(PURPOSE_LIMIT).collect();
        trunk.purpose = if summary.trim().is_empty() {
            "Seed vision trunk derived from the vision summary.".to_string()
        } else {
            summary
        };
        trunk.capabilities = strings(&["vision-tracing", "mpd-draft"]);
        trunk.interfaces = strings(&["plans/seed_to_tensor.acl"]);
        trunk.manager_of = strings(&[GUARDRAILS_NODE]);
        trunk.depends_on = strings(&[CORE_NODE]);
        trunk.policy_pack_ids = root_policies;
        trunk.budgets = BTreeMap::from([("analysis_tokens".to_string(), 20_000.0)]);
        trunk.owners = owners.clone();
        trunk.kpis = vec![KpiReference {
            name: "MIGE_VisionFit".into(),
            target: 0.9,
            unit: None,
        }];
        trunk.witness = witness("seed_to_tensor");
        trunk.links = BTreeMap::from([("plan".to_string(), "plans/seed_to_tensor.acl".to_string())]);
        trunk.max_dependency_degree = 8;

        let mut guardrails = MpdNode::new(GUARDRAILS_NODE, "control", "draft", at);
        guardrails.purpose = "Tracks governance guardrails for trunk evolution.".into();
        guardrails.capabilities = strings(&["gate-validation", "seg-export"]);
        guardrails.interfaces = strings(&["plans/tensor_to_trunk.acl"]);
        guardrails.depends_on = strings(&[TRUNK_NODE]);
        guardrails.policy_pack_ids = guardrail_policies;
        guardrails.budgets = BTreeMap::from([("governance_tokens".to_string(), 5_000.0)]);
        guardrails.owners = owners;
        guardrails.kpis = vec![KpiReference {
            name: "MIGE_BlastRadiusFalseNegatives".into(),
            target: 0.0,
            unit: None,
        }];
        guardrails.witness = witness("tensor_to_trunk");
        guardrails.links = BTreeMap::from([("plan".to_string(), "plans/tensor_to_trunk.acl".to_string())]);
        guardrails.max_dependency_degree = 4;

        vec![trunk, guardrails]
    }

    /// Draft and persist the trunk nodes with their `depends_on` edges.
    pub fn seed_trunk(&self, draft: &TrunkDraft) -> AimosResult<(Vec<MpdNode>, Vec<BitemporalEdge>)> {
        let nodes = Self::draft_trunk_nodes(draft, Utc::now());
        self.repo.upsert_mpd_nodes(&nodes)?;
        let edges = self.repo.upsert_mpd_edges(depends_on_edges(&nodes))?;
        info!(
            correlation_id = draft.correlation_id.as_deref().unwrap_or_default(),
            nodes = nodes.len(),
            edges = edges.len(),
            "Seeded trunk"
        );
        Ok((nodes, edges))
    }

    /// Walk current edges out from `root_ids`, checking policy coverage.
    ///
    /// With no `relation_types` the walk follows `depends_on` edges in both
    /// directions; an explicit list is followed source to target only.
    /// Required packs default to the union of the roots' packs.
    pub fn calculate_blast_radius(
        &self,
        root_ids: &[String],
        relation_types: &[String],
        required_policy_pack_ids: &[String],
    ) -> AimosResult<BlastRadius> {
        let roots = unique(root_ids.iter().cloned());
        if roots.is_empty() {
            return Err(AimosError::validation(
                "at least one root id is required to compute blast radius",
            ));
        }
        let nodes: HashMap<String, MpdNode> = self
            .repo
            .fetch_mpd_nodes(&NodeFilter::default())?
            .into_iter()
            .map(|n| (n.mpd_id.clone(), n))
            .collect();
        let edges = self.repo.fetch_mpd_edges(&EdgeFilter::default())?;

        let relations = unique(relation_types.iter().cloned());
        let bidirectional = relations.is_empty();
        // node id -> (edge, neighbour id)
        let mut adjacency: HashMap<&str, Vec<(&BitemporalEdge, &str)>> = HashMap::new();
        for edge in &edges {
            if bidirectional {
                if edge.relation != DEPENDS_ON {
                    continue;
                }
                adjacency
                    .entry(edge.target.as_str())
                    .or_default()
                    .push((edge, edge.source.as_str()));
            } else if !relations.contains(&edge.relation) {
                continue;
            }
            adjacency
                .entry(edge.source.as_str())
                .or_default()
                .push((edge, edge.target.as_str()));
        }

        let mut required = unique(required_policy_pack_ids.iter().cloned());
        if required.is_empty() {
            required = unique(
                roots
                    .iter()
                    .filter_map(|r| nodes.get(r))
                    .flat_map(|n| n.policy_pack_ids.iter().cloned()),
            );
        }
        let covers = |have: &[String]| required.iter().all(|p| have.contains(p));

        let mut violations = Vec::new();
        let mut impacted = BTreeSet::new();
        let mut traversed = Vec::new();
        let mut queue = VecDeque::new();
        for root in &roots {
            let Some(node) = nodes.get(root) else {
                violations.push(Violation {
                    kind: ViolationKind::MissingNode,
                    subject_id: root.clone(),
                    message: format!("Root node {root} not found."),
                    policy_pack_ids: Vec::new(),
                });
                continue;
            };
            impacted.insert(root.clone());
            if !covers(&node.policy_pack_ids) {
                violations.push(Violation {
                    kind: ViolationKind::NodePolicy,
                    subject_id: root.clone(),
                    message: "Root node missing required policy packs.".into(),
                    policy_pack_ids: node.policy_pack_ids.clone(),
                });
            }
            queue.push_back(root.as_str());
        }

        let mut visited = HashSet::new();
        let mut seen_edges = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            for (edge, neighbour) in adjacency.get(current).into_iter().flatten() {
                if !seen_edges.insert(edge.key()) {
                    continue;
                }
                traversed.push(TraversedEdge {
                    source: edge.source.clone(),
                    target: edge.target.clone(),
                    relation: edge.relation.clone(),
                    policy_pack_ids: edge.policy_pack_ids.clone(),
                });
                if !covers(&edge.policy_pack_ids) {
                    violations.push(Violation {
                        kind: ViolationKind::EdgePolicy,
                        subject_id: format!("{}->{}", edge.source, edge.target),
                        message: "Edge missing required policy packs.".into(),
                        policy_pack_ids: edge.policy_pack_ids.clone(),
                    });
                }
                let Some(node) = nodes.get(*neighbour) else {
                    violations.push(Violation {
                        kind: ViolationKind::MissingNode,
                        subject_id: neighbour.to_string(),
                        message: format!("Node {neighbour} not found."),
                        policy_pack_ids: Vec::new(),
                    });
                    continue;
                };
                if impacted.insert(node.mpd_id.clone()) && !covers(&node.policy_pack_ids) {
                    violations.push(Violation {
                        kind: ViolationKind::NodePolicy,
                        subject_id: node.mpd_id.clone(),
                        message: "Node missing required policy packs.".into(),
                        policy_pack_ids: node.policy_pack_ids.clone(),
                    });
                }
                if !visited.contains(*neighbour) {
                    queue.push_back(neighbour);
                }
            }
        }

        Ok(BlastRadius {
            compliant: violations.is_empty(),
            root_ids: roots,
            required_policy_pack_ids: required,
            impacted_nodes: impacted.into_iter().collect(),
            traversed_edges: traversed,
            violations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::sqlite::SqliteRepository;

    fn registry() -> MpdRegistry {
        MpdRegistry::new(Arc::new(SqliteRepository::open_in_memory().unwrap()))
    }

    #[test]
    fn test_seed_core_is_idempotent() {
        let registry = registry();
        assert_eq!(registry.seed_core_nodes().unwrap(), 7);
        assert_eq!(registry.seed_core_nodes().unwrap(), 0);
        assert_eq!(registry.nodes(&NodeFilter::default()).unwrap().len(), 3);
        assert_eq!(registry.edges(&EdgeFilter::default()).unwrap().len(), 4);
    }

    #[test]
    fn test_core_blast_radius_is_compliant() {
        let registry = registry();
        registry.seed_core_nodes().unwrap();
        let radius = registry
            .calculate_blast_radius(&[CORE_NODE.to_string()], &[], &[])
            .unwrap();
        assert_eq!(
            radius.impacted_nodes,
            vec![CORE_NODE.to_string(), CORE_SEG_NODE.to_string(), CORE_SQLITE_NODE.to_string()]
        );
        assert_eq!(radius.traversed_edges.len(), 2);
        assert!(radius.compliant, "{:?}", radius.violations);
    }

    #[test]
    fn test_blast_radius_reports_violations() {
        let registry = registry();
        registry.seed_core_nodes().unwrap();
        let radius = registry
            .calculate_blast_radius(
                &[CORE_NODE.to_string(), "ghost".to_string()],
                &[MANAGER_OF.to_string()],
                &["policy.seg.default".to_string()],
            )
            .unwrap();
        assert!(!radius.compliant);
        let kinds: Vec<ViolationKind> = radius.violations.iter().map(|v| v.kind).collect();
        assert!(kinds.contains(&ViolationKind::MissingNode));
        assert!(kinds.contains(&ViolationKind::NodePolicy));
        assert!(kinds.contains(&ViolationKind::EdgePolicy));
        assert!(registry.calculate_blast_radius(&[], &[], &[]).is_err());
    }

    #[test]
    fn test_seed_trunk() {
        let registry = registry();
        registry.seed_core_nodes().unwrap();
        let draft = TrunkDraft {
            summary: "Grow the memory-native agent".into(),
            correlation_id: Some("c-42".into()),
            policy_pack_ids: vec!["policy.extra".into()],
            owners: Vec::new(),
        };
        let (nodes, edges) = registry.seed_trunk(&draft).unwrap();
        assert_eq!(nodes[0].mpd_id, TRUNK_NODE);
        assert_eq!(nodes[0].kpis[0].target, 0.9);
        assert_eq!(nodes[0].witness.as_deref(), Some("seg://plan/seed_to_tensor/c-42"));
        assert!(nodes[1].policy_pack_ids.contains(&GUARDRAILS_POLICY.to_string()));
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| !e.policy_pack_ids.is_empty()));

        let radius = registry
            .calculate_blast_radius(&[TRUNK_NODE.to_string()], &[], &[])
            .unwrap();
        assert!(radius.impacted_nodes.contains(&GUARDRAILS_NODE.to_string()));
        assert!(radius.impacted_nodes.contains(&CORE_NODE.to_string()));
    }
}
