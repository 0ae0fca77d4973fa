//! MPD registry types: bitemporal nodes and edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Relation label that requires at least one policy pack.
pub const DEPENDS_ON: &str = "depends_on";
/// Relation label for management links.
pub const MANAGER_OF: &str = "manager_of";

/// Which time axis a bitemporal query runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeAxis {
    /// What the system believed at t.
    #[default]
    Transaction,
    /// What the system asserts was true at t.
    Valid,
}

impl TimeAxis {
    /// Map the `use_transaction_time` flag onto an axis.
    pub fn from_flag(use_transaction_time: bool) -> Self {
        if use_transaction_time {
            Self::Transaction
        } else {
            Self::Valid
        }
    }

    /// Name used in query results.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transaction => "transaction_time",
            Self::Valid => "valid_time",
        }
    }
}

/// How a policy-pack filter matches a row's packs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMatch {
    /// Every requested pack must be present.
    #[default]
    All,
    /// At least one requested pack must be present.
    Any,
}

impl PolicyMatch {
    /// Apply this matcher.
    pub fn matches(&self, have: &[String], want: &[String]) -> bool {
        if want.is_empty() {
            return true;
        }
        match self {
            Self::All => want.iter().all(|w| have.contains(w)),
            Self::Any => want.iter().any(|w| have.contains(w)),
        }
    }
}

/// Half-open `[start, end)` interval with an open end meaning +inf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end; `None` is open.
    pub end: Option<DateTime<Utc>>,
}

impl Interval {
    /// `start <= t < end`.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && self.end.map_or(true, |end| end > t)
    }

    /// Intersection with the closed window `[t0, t1]`.
    pub fn intersects_closed(&self, t0: DateTime<Utc>, t1: DateTime<Utc>) -> bool {
        self.start <= t1 && self.end.map_or(true, |end| end > t0)
    }

    /// Intersection with the half-open window `[t0, t1)`.
    pub fn intersects_half_open(&self, t0: DateTime<Utc>, t1: DateTime<Utc>) -> bool {
        self.start < t1 && self.end.map_or(true, |end| end > t0)
    }

    /// True while the interval is open.
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }
}

/// Reference to a KPI tracked by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiReference {
    /// KPI name.
    pub name: String,
    /// Target value.
    pub target: f64,
    /// Unit, if any.
    #[serde(default)]
    pub unit: Option<String>,
}

/// One version of an MPD node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpdNode {
    /// Node identifier (stable across versions).
    pub mpd_id: String,
    /// Node type (component, program, control, ...).
    pub node_type: String,
    /// Free-text purpose.
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub manager_of: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub policy_pack_ids: Vec<String>,
    /// Named numeric budgets.
    #[serde(default)]
    pub budgets: BTreeMap<String, f64>,
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub kpis: Vec<KpiReference>,
    /// Lifecycle label (draft, active, retired, ...).
    pub lifecycle: String,
    /// Witness reference.
    #[serde(default)]
    pub witness: Option<String>,
    /// Named links to external documents.
    #[serde(default)]
    pub links: BTreeMap<String, String>,
    /// Cap on open outgoing `depends_on` edges; zero disables the cap.
    #[serde(default)]
    pub max_dependency_degree: u32,
    pub tt_start: DateTime<Utc>,
    pub tt_end: Option<DateTime<Utc>>,
    pub vt_start: DateTime<Utc>,
    pub vt_end: Option<DateTime<Utc>>,
}

impl MpdNode {
    /// A minimal node valid and recorded from `at`.
    pub fn new(
        mpd_id: impl Into<String>,
        node_type: impl Into<String>,
        lifecycle: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            mpd_id: mpd_id.into(),
            node_type: node_type.into(),
            purpose: String::new(),
            capabilities: Vec::new(),
            interfaces: Vec::new(),
            manager_of: Vec::new(),
            depends_on: Vec::new(),
            policy_pack_ids: Vec::new(),
            budgets: BTreeMap::new(),
            owners: Vec::new(),
            kpis: Vec::new(),
            lifecycle: lifecycle.into(),
            witness: None,
            links: BTreeMap::new(),
            max_dependency_degree: 0,
            tt_start: at,
            tt_end: None,
            vt_start: at,
            vt_end: None,
        }
    }

    /// The interval on the chosen axis.
    pub fn interval(&self, axis: TimeAxis) -> Interval {
        match axis {
            TimeAxis::Transaction => Interval {
                start: self.tt_start,
                end: self.tt_end,
            },
            TimeAxis::Valid => Interval {
                start: self.vt_start,
                end: self.vt_end,
            },
        }
    }

    /// Both intervals open.
    pub fn is_current(&self) -> bool {
        self.tt_end.is_none() && self.vt_end.is_none()
    }
}

/// One version of a directed relation between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitemporalEdge {
    pub source: String,
    pub target: String,
    /// Relation label.
    pub relation: String,
    #[serde(default)]
    pub policy_pack_ids: Vec<String>,
    /// Witness reference.
    #[serde(default)]
    pub witness: Option<String>,
    pub tt_start: DateTime<Utc>,
    pub tt_end: Option<DateTime<Utc>>,
    pub vt_start: DateTime<Utc>,
    pub vt_end: Option<DateTime<Utc>>,
}

impl BitemporalEdge {
    /// An edge valid and recorded from `at`.
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        relation: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            relation: relation.into(),
            policy_pack_ids: Vec::new(),
            witness: None,
            tt_start: at,
            tt_end: None,
            vt_start: at,
            vt_end: None,
        }
    }

    /// Builder-style policy assignment.
    pub fn with_policies(mut self, policies: Vec<String>) -> Self {
        self.policy_pack_ids = policies;
        self
    }

    /// The interval on the chosen axis.
    pub fn interval(&self, axis: TimeAxis) -> Interval {
        match axis {
            TimeAxis::Transaction => Interval {
                start: self.tt_start,
                end: self.tt_end,
            },
            TimeAxis::Valid => Interval {
                start: self.vt_start,
                end: self.vt_end,
            },
        }
    }

    /// Identity of the relation across versions.
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.source, &self.target, &self.relation)
    }

    pub fn is_current(&self) -> bool {
        self.tt_end.is_none() && self.vt_end.is_none()
    }
}

/// Filter for [`MpdNode`] listings.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub lifecycle: Option<String>,
    pub policy_pack_ids: Vec<String>,
    pub policy_match: PolicyMatch,
    /// Include closed versions too.
    pub include_history: bool,
}

impl NodeFilter {
    pub fn matches(&self, node: &MpdNode) -> bool {
        if !self.include_history && node.tt_end.is_some() {
            return false;
        }
        if let Some(lifecycle) = &self.lifecycle {
            if &node.lifecycle != lifecycle {
                return false;
            }
        }
        self.policy_match
            .matches(&node.policy_pack_ids, &self.policy_pack_ids)
    }
}

/// Filter for [`BitemporalEdge`] listings.
#[derive(Debug, Clone, Default)]
pub struct EdgeFilter {
    pub relation: Option<String>,
    pub source: Option<String>,
    pub target: Option<String>,
    pub policy_pack_ids: Vec<String>,
    pub policy_match: PolicyMatch,
    pub include_history: bool,
}

impl EdgeFilter {
    pub fn matches(&self, edge: &BitemporalEdge) -> bool {
        if !self.include_history && edge.tt_end.is_some() {
            return false;
        }
        if self.relation.as_ref().is_some_and(|r| r != &edge.relation)
            || self.source.as_ref().is_some_and(|s| s != &edge.source)
            || self.target.as_ref().is_some_and(|t| t != &edge.target)
        {
            return false;
        }
        self.policy_match
            .matches(&edge.policy_pack_ids, &self.policy_pack_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_interval_half_open() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let t1 = t0 + Duration::hours(1);
        let iv = Interval {
            start: t0,
            end: Some(t1),
        };
        assert!(iv.contains(t0));
        assert!(!iv.contains(t1));
        assert!(Interval { start: t0, end: None }.contains(t1 + Duration::days(365)));
        assert!(iv.intersects_closed(t1 - Duration::seconds(1), t1 + Duration::hours(1)));
        assert!(!iv.intersects_half_open(t1, t1 + Duration::hours(1)));
    }

    #[test]
    fn test_policy_match_modes() {
        let have = vec!["a".to_string(), "b".to_string()];
        assert!(PolicyMatch::All.matches(&have, &["a".into(), "b".into()]));
        assert!(!PolicyMatch::All.matches(&have, &["a".into(), "c".into()]));
        assert!(PolicyMatch::Any.matches(&have, &["a".into(), "c".into()]));
        assert!(PolicyMatch::Any.matches(&have, &[]));
    }

    #[test]
    fn test_node_filter_skips_closed_rows() {
        let at = Utc::now();
        let mut node = MpdNode::new("aimos.cmc", "component", "active", at);
        let filter = NodeFilter {
            lifecycle: Some("active".into()),
            ..Default::default()
        };
        assert!(filter.matches(&node));
        node.tt_end = Some(at);
        assert!(!filter.matches(&node));
    }
}
