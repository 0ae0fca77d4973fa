//! Bitemporal queries over the MPD node and edge streams.
//!
//! Intervals are half-open `[start, end)` with an open end meaning +inf.
//! Transaction-time answers describe what the store believed at `t`;
//! valid-time answers describe what the store currently asserts was true at
//! `t`, so they only consider versions that have not been superseded.

use crate::repository::AtomRepository;
use aimos_types::mpd::{BitemporalEdge, EdgeFilter, Interval, MpdNode, TimeAxis};
use aimos_types::{AimosError, AimosResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Decomposition of the node and edge versions touching a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    pub axis: TimeAxis,
    pub added: Vec<MpdNode>,
    pub modified: Vec<MpdNode>,
    pub removed: Vec<MpdNode>,
    /// Edge versions, keyed by `(source, target, relation)`.
    pub edges_added: Vec<BitemporalEdge>,
    pub edges_modified: Vec<BitemporalEdge>,
    pub edges_removed: Vec<BitemporalEdge>,
}

impl ChangeSet {
    /// Node and edge versions together.
    pub fn total(&self) -> usize {
        self.added.len()
            + self.modified.len()
            + self.removed.len()
            + self.edges_added.len()
            + self.edges_modified.len()
            + self.edges_removed.len()
    }
}

/// Every recorded version of a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditTrail {
    pub node_id: String,
    /// Versions ordered by transaction start.
    pub versions: Vec<MpdNode>,
    pub version_count: usize,
    pub first_recorded: Option<DateTime<Utc>>,
    /// The version whose transaction interval is still open.
    pub current: Option<MpdNode>,
    /// Edge versions that ever touched the node, when requested.
    pub edges: Vec<BitemporalEdge>,
}

/// Full state in force at an instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeTravelView {
    pub timestamp: DateTime<Utc>,
    pub axis: TimeAxis,
    pub nodes: Vec<MpdNode>,
    pub edges: Option<Vec<BitemporalEdge>>,
}

/// Read-only query engine over a repository's MPD streams.
pub struct BitemporalQueryEngine {
    repo: Arc<dyn AtomRepository>,
}

/// Whether a version takes part in answers on `axis`.
fn believed(axis: TimeAxis, tt_end: Option<DateTime<Utc>>) -> bool {
    axis == TimeAxis::Transaction || tt_end.is_none()
}

fn check_window(t0: DateTime<Utc>, t1: DateTime<Utc>) -> AimosResult<()> {
    if t0 > t1 {
        return Err(AimosError::Validation(format!(
            "window start {t0} is after its end {t1}"
        )));
    }
    Ok(())
}

/// A stored version: its transaction start plus its interval on an axis.
trait Versioned {
    fn span(&self, axis: TimeAxis) -> (DateTime<Utc>, Interval);
}

impl Versioned for MpdNode {
    fn span(&self, axis: TimeAxis) -> (DateTime<Utc>, Interval) {
        (self.tt_start, self.interval(axis))
    }
}

impl Versioned for BitemporalEdge {
    fn span(&self, axis: TimeAxis) -> (DateTime<Utc>, Interval) {
        (self.tt_start, self.interval(axis))
    }
}

/// Rows touching `[t0, t1)` as `(added, modified, removed)`.
///
/// A row is added when it starts inside the window with no earlier version
/// of its key still running at that start; removed when it ends before
/// `t1`; modified otherwise. `versions` loads the history of one key and
/// is called once per key.
fn partition_changes<T, K>(
    candidates: Vec<T>,
    axis: TimeAxis,
    t0: DateTime<Utc>,
    t1: DateTime<Utc>,
    key: impl Fn(&T) -> K,
    versions: impl Fn(&K) -> AimosResult<Vec<T>>,
) -> AimosResult<(Vec<T>, Vec<T>, Vec<T>)>
where
    T: Versioned,
    K: Eq + Hash,
{
    let mut histories: HashMap<K, Vec<(DateTime<Utc>, Interval)>> = HashMap::new();
    let (mut added, mut modified, mut removed) = (Vec::new(), Vec::new(), Vec::new());

    for row in candidates {
        let (tt_start, iv) = row.span(axis);
        if !iv.intersects_half_open(t0, t1) {
            continue;
        }
        let history = match histories.entry(key(&row)) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let spans = versions(entry.key())?.iter().map(|v| v.span(axis)).collect();
                entry.insert(spans)
            }
        };
        let had_previous = history.iter().any(|(other_start, prev)| {
            *other_start != tt_start && prev.start < iv.start && prev.end.map_or(true, |end| end >= iv.start)
        });
        if iv.start >= t0 && iv.start < t1 && !had_previous {
            added.push(row);
        } else if iv.end.is_some_and(|end| end < t1) {
            removed.push(row);
        } else {
            modified.push(row);
        }
    }
    Ok((added, modified, removed))
}

impl BitemporalQueryEngine {
    pub fn new(repo: Arc<dyn AtomRepository>) -> Self {
        Self { repo }
    }

    /// Nodes whose chosen interval contains `t`.
    pub fn query_nodes_as_of(&self, t: DateTime<Utc>, use_transaction_time: bool) -> AimosResult<Vec<MpdNode>> {
        let axis = TimeAxis::from_flag(use_transaction_time);
        Ok(self
            .repo
            .fetch_nodes_overlapping(axis, t, t)?
            .into_iter()
            .filter(|n| believed(axis, n.tt_end) && n.interval(axis).contains(t))
            .collect())
    }

    /// Nodes whose chosen interval intersects the closed window `[t0, t1]`.
    pub fn query_nodes_in_range(
        &self,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
        use_transaction_time: bool,
    ) -> AimosResult<Vec<MpdNode>> {
        check_window(t0, t1)?;
        let axis = TimeAxis::from_flag(use_transaction_time);
        Ok(self
            .repo
            .fetch_nodes_overlapping(axis, t0, t1)?
            .into_iter()
            .filter(|n| believed(axis, n.tt_end) && n.interval(axis).intersects_closed(t0, t1))
            .collect())
    }

    /// Every version of a node, ordered by start on the chosen axis.
    pub fn query_node_history(&self, node_id: &str, use_transaction_time: bool) -> AimosResult<Vec<MpdNode>> {
        let axis = TimeAxis::from_flag(use_transaction_time);
        let mut versions = self.repo.fetch_node_versions(node_id)?;
        versions.sort_by_key(|n| (n.interval(axis).start, n.tt_start));
        Ok(versions)
    }

    /// Split the node and edge versions touching `[t0, t1)` into added,
    /// removed and modified, checked in that order.
    pub fn query_changes_between(
        &self,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
        use_transaction_time: bool,
    ) -> AimosResult<ChangeSet> {
        check_window(t0, t1)?;
        let axis = TimeAxis::from_flag(use_transaction_time);

        let (added, modified, removed) = partition_changes(
            self.repo.fetch_nodes_overlapping(axis, t0, t1)?,
            axis,
            t0,
            t1,
            |n: &MpdNode| n.mpd_id.clone(),
            |id: &String| self.repo.fetch_node_versions(id),
        )?;
        let (edges_added, edges_modified, edges_removed) = partition_changes(
            self.repo.fetch_edges_overlapping(axis, t0, t1)?,
            axis,
            t0,
            t1,
            |e: &BitemporalEdge| (e.source.clone(), e.target.clone(), e.relation.clone()),
            |(source, target, relation): &(String, String, String)| {
                self.repo.fetch_edge_versions(source, target, relation)
            },
        )?;

        Ok(ChangeSet {
            axis,
            added,
            modified,
            removed,
            edges_added,
            edges_modified,
            edges_removed,
        })
    }

    /// Edges whose chosen interval contains `t`.
    pub fn query_edges_as_of(&self, t: DateTime<Utc>, use_transaction_time: bool) -> AimosResult<Vec<BitemporalEdge>> {
        let axis = TimeAxis::from_flag(use_transaction_time);
        Ok(self
            .repo
            .fetch_edges_overlapping(axis, t, t)?
            .into_iter()
            .filter(|e| believed(axis, e.tt_end) && e.interval(axis).contains(t))
            .collect())
    }

    /// All versions of a node (and optionally every edge version touching
    /// it), chronologically.
    pub fn audit_trail(&self, node_id: &str, include_edges: bool) -> AimosResult<AuditTrail> {
        let versions = self.query_node_history(node_id, true)?;
        let edges = if include_edges {
            let history = |source: Option<&str>, target: Option<&str>| {
                self.repo.fetch_mpd_edges(&EdgeFilter {
                    source: source.map(str::to_string),
                    target: target.map(str::to_string),
                    include_history: true,
                    ..Default::default()
                })
            };
            let mut edges = history(Some(node_id), None)?;
            // Self-loops already came back with the outgoing edges.
            edges.extend(
                history(None, Some(node_id))?
                    .into_iter()
                    .filter(|e| e.source != node_id),
            );
            edges.sort_by_key(|e| e.tt_start);
            edges
        } else {
            Vec::new()
        };
        Ok(AuditTrail {
            node_id: node_id.to_string(),
            version_count: versions.len(),
            first_recorded: versions.first().map(|v| v.tt_start),
            current: versions.iter().find(|v| v.tt_end.is_none()).cloned(),
            versions,
            edges,
        })
    }

    /// Everything in force at `t` on the chosen axis.
    pub fn time_travel(
        &self,
        t: DateTime<Utc>,
        use_transaction_time: bool,
        include_edges: bool,
    ) -> AimosResult<TimeTravelView> {
        let nodes = self.query_nodes_as_of(t, use_transaction_time)?;
        let edges = if include_edges {
            Some(self.query_edges_as_of(t, use_transaction_time)?)
        } else {
            None
        };
        Ok(TimeTravelView {
            timestamp: t,
            axis: TimeAxis::from_flag(use_transaction_time),
            nodes,
            edges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::sqlite::SqliteRepository;
    use aimos_types::mpd::DEPENDS_ON;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn engine() -> (Arc<dyn AtomRepository>, BitemporalQueryEngine) {
        let repo: Arc<dyn AtomRepository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        (repo.clone(), BitemporalQueryEngine::new(repo))
    }

    #[test]
    fn test_as_of_on_both_axes() {
        let (repo, engine) = engine();
        let mut node = MpdNode::new("n", "component", "active", t0() + Duration::days(10));
        node.vt_start = t0();
        repo.upsert_mpd_node(&node).unwrap();

        // Valid from t0, but only recorded ten days later.
        let t = t0() + Duration::days(1);
        assert!(engine.query_nodes_as_of(t, true).unwrap().is_empty());
        assert_eq!(engine.query_nodes_as_of(t, false).unwrap().len(), 1);
    }

    #[test]
    fn test_changes_partition() {
        let (repo, engine) = engine();
        repo.upsert_mpd_node(&MpdNode::new("old", "component", "active", t0())).unwrap();
        repo.upsert_mpd_node(&MpdNode::new("old", "component", "retired", t0() + Duration::hours(5)))
            .unwrap();
        repo.upsert_mpd_node(&MpdNode::new("new", "component", "active", t0() + Duration::hours(6)))
            .unwrap();

        let changes = engine
            .query_changes_between(t0() + Duration::hours(1), t0() + Duration::hours(12), true)
            .unwrap();
        assert_eq!(changes.added.iter().map(|n| n.mpd_id.as_str()).collect::<Vec<_>>(), vec!["new"]);
        assert_eq!(changes.removed.len(), 1);
        assert_eq!(changes.removed[0].lifecycle, "active");
        assert_eq!(changes.modified.len(), 1);
        assert_eq!(changes.modified[0].lifecycle, "retired");
        assert_eq!(changes.total(), 3);
    }

    #[test]
    fn test_changes_track_edge_versions() {
        let (repo, engine) = engine();
        let mut source = MpdNode::new("a", "component", "active", t0());
        source.policy_pack_ids = vec!["p".into()];
        repo.upsert_mpd_node(&source).unwrap();
        repo.upsert_mpd_edge(BitemporalEdge::new("a", "b", DEPENDS_ON, t0())).unwrap();

        // Retire a -> b inside the window and add a -> c.
        let mut retired = BitemporalEdge::new("a", "b", DEPENDS_ON, t0() + Duration::hours(5));
        retired.vt_start = t0();
        retired.vt_end = Some(t0() + Duration::hours(5));
        repo.upsert_mpd_edge(retired).unwrap();
        repo.upsert_mpd_edge(BitemporalEdge::new("a", "c", DEPENDS_ON, t0() + Duration::hours(6)))
            .unwrap();

        let changes = engine
            .query_changes_between(t0() + Duration::hours(1), t0() + Duration::hours(12), true)
            .unwrap();
        let targets = |edges: &[BitemporalEdge]| edges.iter().map(|e| e.target.clone()).collect::<Vec<_>>();
        assert_eq!(targets(&changes.edges_added), vec!["c"]);
        assert_eq!(targets(&changes.edges_removed), vec!["b"]);
        assert_eq!(changes.edges_removed[0].vt_end, None);
        assert_eq!(targets(&changes.edges_modified), vec!["b"]);
        assert_eq!(changes.edges_modified[0].vt_end, Some(t0() + Duration::hours(5)));
        // The node itself predates the window and never changed.
        assert_eq!(changes.modified.len(), 1);
        assert_eq!(changes.total(), 4);

        // On valid time the retired edge ends inside the window.
        let valid = engine
            .query_changes_between(t0() + Duration::hours(1), t0() + Duration::hours(12), false)
            .unwrap();
        assert!(valid.edges_removed.iter().any(|e| e.target == "b" && e.vt_end.is_some()));
    }

    #[test]
    fn test_history_reads_one_node() {
        let (repo, engine) = engine();
        for (id, hour) in [("a", 0), ("b", 1), ("a", 2), ("b", 3), ("a", 4)] {
            repo.upsert_mpd_node(&MpdNode::new(id, "component", "active", t0() + Duration::hours(hour)))
                .unwrap();
        }
        let history = engine.query_node_history("a", true).unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|n| n.mpd_id == "a"));
        assert_eq!(history[0].tt_end, Some(t0() + Duration::hours(2)));
        assert!(history[2].tt_end.is_none());
        assert!(engine.query_node_history("missing", true).unwrap().is_empty());
    }

    #[test]
    fn test_range_rejects_inverted_window() {
        let (_, engine) = engine();
        let err = engine
            .query_nodes_in_range(t0() + Duration::hours(1), t0(), true)
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn test_audit_trail_and_time_travel() {
        let (repo, engine) = engine();
        let mut source = MpdNode::new("a", "component", "draft", t0());
        source.policy_pack_ids = vec!["p".into()];
        repo.upsert_mpd_node(&source).unwrap();
        let mut next = source.clone();
        next.lifecycle = "active".into();
        next.tt_start = t0() + Duration::hours(1);
        repo.upsert_mpd_node(&next).unwrap();
        repo.upsert_mpd_edge(BitemporalEdge::new("a", "b", "depends_on", t0() + Duration::hours(2)))
            .unwrap();

        let trail = engine.audit_trail("a", true).unwrap();
        assert_eq!(trail.version_count, 2);
        assert_eq!(trail.first_recorded, Some(t0()));
        assert_eq!(trail.current.unwrap().lifecycle, "active");
        assert_eq!(trail.edges.len(), 1);

        let view = engine.time_travel(t0() + Duration::minutes(30), true, true).unwrap();
        assert_eq!(view.nodes.len(), 1);
        assert_eq!(view.nodes[0].lifecycle, "draft");
        assert_eq!(view.edges, Some(Vec::new()));
    }
}
