//! In-memory evidence graph with bitemporal versions.
//!
//! Records are kept as append-only version lists keyed by id; an update
//! closes the open version and appends a new one. Relations refer to
//! entities by id only, so cycles never become ownership cycles.

use aimos_types::atom::AtomCatalog;
use aimos_types::canonical::sha256_hex;
use aimos_types::seg::{
    Contradiction, Entity, EntityPatch, Evidence, Relation, RelationKind, TimeSlice,
};
use aimos_types::{AimosError, AimosResult};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// `contradiction_type` of records derived from `CONTRADICTS` relations.
pub const EXPLICIT_CONTRADICTION: &str = "explicit_contradiction";

trait Temporal: Clone {
    fn tt_start(&self) -> DateTime<Utc>;
    fn tt_end(&self) -> Option<DateTime<Utc>>;
    fn close(&mut self, at: DateTime<Utc>);

    fn recorded_at(&self, t: DateTime<Utc>) -> bool {
        self.tt_start() <= t && self.tt_end().map_or(true, |end| end > t)
    }
}

macro_rules! temporal {
    ($($ty:ty),*) => {$(
        impl Temporal for $ty {
            fn tt_start(&self) -> DateTime<Utc> {
                self.tt_start
            }
            fn tt_end(&self) -> Option<DateTime<Utc>> {
                self.tt_end
            }
            fn close(&mut self, at: DateTime<Utc>) {
                self.tt_end = Some(at);
            }
        }
    )*};
}

temporal!(Entity, Relation, Evidence);

/// Version lists per id, iterated in first-insertion order.
#[derive(Debug)]
struct Versions<T> {
    order: Vec<String>,
    by_id: HashMap<String, Vec<T>>,
}

impl<T> Default for Versions<T> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            by_id: HashMap::new(),
        }
    }
}

impl<T: Temporal> Versions<T> {
    fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    fn push(&mut self, id: &str, version: T) {
        match self.by_id.get_mut(id) {
            Some(versions) => versions.push(version),
            None => {
                self.order.push(id.to_string());
                self.by_id.insert(id.to_string(), vec![version]);
            }
        }
    }

    /// Latest version if its transaction interval is still open.
    fn current(&self, id: &str) -> Option<&T> {
        self.by_id
            .get(id)
            .and_then(|v| v.last())
            .filter(|v| v.tt_end().is_none())
    }

    fn at(&self, id: &str, as_of: Option<DateTime<Utc>>) -> Option<&T> {
        match as_of {
            None => self.current(id),
            Some(t) => self.by_id.get(id)?.iter().rev().find(|v| v.recorded_at(t)),
        }
    }

    fn history(&self, id: &str) -> &[T] {
        self.by_id.get(id).map_or(&[], Vec::as_slice)
    }

    fn visible(&self, as_of: Option<DateTime<Utc>>) -> impl Iterator<Item = &T> {
        self.order.iter().filter_map(move |id| self.at(id, as_of))
    }

    fn all_versions(&self) -> impl Iterator<Item = &T> {
        self.order.iter().flat_map(move |id| self.history(id).iter())
    }

    /// Close the current version of `id`, returning the time used.
    fn close_current(&mut self, id: &str) -> Option<DateTime<Utc>> {
        let version = self.by_id.get_mut(id)?.last_mut()?;
        if version.tt_end().is_some() {
            return None;
        }
        let at = next_tt(version.tt_start());
        version.close(at);
        Some(at)
    }
}

/// A transaction time strictly after `prev`.
fn next_tt(prev: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(prev + Duration::microseconds(1))
}

fn check_unit(what: &str, value: f64) -> AimosResult<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(AimosError::Validation(format!(
            "{what} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

fn assign_id(id: &mut String) {
    if id.trim().is_empty() {
        *id = Uuid::new_v4().to_string();
    }
}

fn contradiction_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let digest = sha256_hex(format!("{lo}|{hi}"));
    format!("contradiction:{}", &digest[..32])
}

/// Filter for [`SegGraph::get_relations`].
#[derive(Debug, Clone, Default)]
pub struct RelationQuery {
    pub source_id: Option<String>,
    pub target_id: Option<String>,
    pub kind: Option<RelationKind>,
    pub as_of: Option<DateTime<Utc>>,
}

impl RelationQuery {
    fn matches(&self, relation: &Relation) -> bool {
        self.source_id.as_ref().map_or(true, |s| *s == relation.source_id)
            && self.target_id.as_ref().map_or(true, |t| *t == relation.target_id)
            && self.kind.map_or(true, |k| k == relation.kind)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegStats {
    /// Entities with an open version.
    pub entity_count: usize,
    pub entity_versions: usize,
    pub relation_count: usize,
    pub evidence_count: usize,
    pub contradiction_count: usize,
}

/// Serializable dump of every version in a graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegExport {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
    pub evidence: Vec<Evidence>,
    pub contradictions: Vec<Contradiction>,
    pub stats: SegStats,
}

#[derive(Default)]
struct GraphState {
    entities: Versions<Entity>,
    relations: Versions<Relation>,
    evidence: Versions<Evidence>,
    contradiction_order: Vec<String>,
    contradictions: HashMap<String, Contradiction>,
}

impl GraphState {
    fn trace(
        &self,
        current: &str,
        depth: usize,
        max_depth: usize,
        visited: &mut HashSet<String>,
        out: &mut Vec<(Entity, Relation)>,
    ) {
        if depth >= max_depth || out.len() >= max_depth || !visited.insert(current.to_string()) {
            return;
        }
        let incoming = self
            .relations
            .visible(None)
            .filter(|r| r.kind == RelationKind::DerivesFrom && r.target_id == current);
        for relation in incoming {
            if out.len() >= max_depth {
                return;
            }
            if let Some(ancestor) = self.entities.current(&relation.source_id) {
                out.push((ancestor.clone(), relation.clone()));
                self.trace(&ancestor.id, depth + 1, max_depth, visited, out);
            }
        }
    }

    fn store_contradiction(&mut self, record: Contradiction) {
        if !self.contradictions.contains_key(&record.id) {
            self.contradiction_order.push(record.id.clone());
        }
        self.contradictions.insert(record.id.clone(), record);
    }
}

/// Evidence graph of entities, relations and evidence.
pub struct SegGraph {
    state: RwLock<GraphState>,
    catalog: Option<Arc<dyn AtomCatalog>>,
}

impl Default for SegGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl SegGraph {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            catalog: None,
        }
    }

    /// Check evidence atom references against `catalog` on ingestion.
    pub fn with_catalog(mut self, catalog: Arc<dyn AtomCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    // -- entities -----------------------------------------------------------

    /// Add an entity. An empty id is replaced with a fresh UUID; an id that
    /// already exists returns the stored version untouched.
    pub fn add_entity(&self, mut entity: Entity) -> AimosResult<Entity> {
        assign_id(&mut entity.id);
        check_unit("entity confidence", entity.confidence)?;
        let mut state = self.state.write();
        if let Some(existing) = state.entities.history(&entity.id).last() {
            debug!(entity_id = %entity.id, "Entity already present");
            return Ok(existing.clone());
        }
        state.entities.push(&entity.id.clone(), entity.clone());
        Ok(entity)
    }

    /// The version in force at `as_of`, or the current one.
    pub fn get_entity(&self, id: &str, as_of: Option<DateTime<Utc>>) -> Option<Entity> {
        self.state.read().entities.at(id, as_of).cloned()
    }

    /// Close the current version and append the patched one.
    ///
    /// Returns `Ok(None)` when no current version exists.
    pub fn update_entity(&self, id: &str, patch: EntityPatch) -> AimosResult<Option<Entity>> {
        if let Some(confidence) = patch.confidence {
            check_unit("entity confidence", confidence)?;
        }
        let mut state = self.state.write();
        let Some(mut next) = state.entities.current(id).cloned() else {
            return Ok(None);
        };
        let Some(at) = state.entities.close_current(id) else {
            return Ok(None);
        };
        if let Some(name) = patch.name {
            next.name = name;
        }
        if let Some(entity_type) = patch.entity_type {
            next.entity_type = entity_type;
        }
        next.attributes.extend(patch.attributes);
        if let Some(confidence) = patch.confidence {
            next.confidence = confidence;
        }
        if patch.vt_end.is_some() {
            next.vt_end = patch.vt_end;
        }
        if patch.witness_id.is_some() {
            next.witness_id = patch.witness_id;
        }
        next.tt_start = at;
        next.tt_end = None;
        state.entities.push(id, next.clone());
        debug!(entity_id = id, version = state.entities.history(id).len(), "Entity updated");
        Ok(Some(next))
    }

    pub fn list_entities(&self, entity_type: Option<&str>, as_of: Option<DateTime<Utc>>) -> Vec<Entity> {
        self.state
            .read()
            .entities
            .visible(as_of)
            .filter(|e| entity_type.map_or(true, |t| e.entity_type == t))
            .cloned()
            .collect()
    }

    /// Every version of an entity, oldest first.
    pub fn get_entity_history(&self, id: &str) -> Vec<Entity> {
        self.state.read().entities.history(id).to_vec()
    }

    // -- relations ----------------------------------------------------------

    /// Add a relation between two current entities.
    pub fn add_relation(&self, mut relation: Relation) -> AimosResult<Relation> {
        assign_id(&mut relation.id);
        check_unit("relation confidence", relation.confidence)?;
        let mut state = self.state.write();
        if let Some(existing) = state.relations.history(&relation.id).last() {
            return Ok(existing.clone());
        }
        for (role, id) in [("source", &relation.source_id), ("target", &relation.target_id)] {
            if state.entities.current(id).is_none() {
                return Err(AimosError::Validation(format!(
                    "{role} entity {id} not found"
                )));
            }
        }
        state.relations.push(&relation.id.clone(), relation.clone());
        Ok(relation)
    }

    pub fn get_relation(&self, id: &str) -> Option<Relation> {
        self.state.read().relations.current(id).cloned()
    }

    pub fn get_relations(&self, query: &RelationQuery) -> Vec<Relation> {
        self.state
            .read()
            .relations
            .visible(query.as_of)
            .filter(|r| query.matches(r))
            .cloned()
            .collect()
    }

    pub fn incoming_relations(&self, entity_id: &str) -> Vec<Relation> {
        self.get_relations(&RelationQuery {
            target_id: Some(entity_id.to_string()),
            ..Default::default()
        })
    }

    pub fn outgoing_relations(&self, entity_id: &str) -> Vec<Relation> {
        self.get_relations(&RelationQuery {
            source_id: Some(entity_id.to_string()),
            ..Default::default()
        })
    }

    /// Close the current version of a relation.
    pub fn retract_relation(&self, id: &str) -> Option<Relation> {
        let mut state = self.state.write();
        state.relations.close_current(id)?;
        state.relations.history(id).last().cloned()
    }

    // -- evidence -----------------------------------------------------------

    /// Add evidence. With a catalog attached, a backing atom must exist and
    /// predate the evidence's transaction start.
    pub fn add_evidence(&self, mut evidence: Evidence) -> AimosResult<Evidence> {
        assign_id(&mut evidence.id);
        check_unit("evidence reliability", evidence.reliability)?;
        check_unit("evidence confidence", evidence.confidence)?;
        if let Some(existing) = self.state.read().evidence.history(&evidence.id).last() {
            return Ok(existing.clone());
        }
        if let (Some(catalog), Some(atom_id)) = (&self.catalog, &evidence.atom_id) {
            match catalog.atom_created_at(atom_id)? {
                None => {
                    return Err(AimosError::Validation(format!(
                        "evidence {} references unknown atom {atom_id}",
                        evidence.id
                    )))
                }
                Some(created) if created > evidence.tt_start => {
                    return Err(AimosError::Validation(format!(
                        "evidence {} predates its atom {atom_id}",
                        evidence.id
                    )))
                }
                Some(_) => {}
            }
        }
        let mut state = self.state.write();
        if let Some(existing) = state.evidence.history(&evidence.id).last() {
            return Ok(existing.clone());
        }
        state.evidence.push(&evidence.id.clone(), evidence.clone());
        Ok(evidence)
    }

    pub fn get_evidence(&self, id: &str) -> Option<Evidence> {
        self.state.read().evidence.current(id).cloned()
    }

    pub fn list_evidence(&self, as_of: Option<DateTime<Utc>>) -> Vec<Evidence> {
        self.state.read().evidence.visible(as_of).cloned().collect()
    }

    // -- analyses -----------------------------------------------------------

    /// Counts of records in force at `t`.
    pub fn query_at(&self, t: DateTime<Utc>) -> TimeSlice {
        let state = self.state.read();
        TimeSlice {
            timestamp: t,
            entity_count: state.entities.visible(Some(t)).count(),
            relation_count: state.relations.visible(Some(t)).count(),
            evidence_count: state.evidence.visible(Some(t)).count(),
        }
    }

    /// Ancestors reached through incoming `DERIVES_FROM` relations,
    /// depth-first, at most `max_depth` entries.
    pub fn trace_provenance(&self, id: &str, max_depth: usize) -> Vec<(Entity, Relation)> {
        let state = self.state.read();
        let mut out = Vec::new();
        state.trace(id, 0, max_depth, &mut HashSet::new(), &mut out);
        out
    }

    /// One record per unordered entity pair joined by a current
    /// `CONTRADICTS` relation. Records are stored in the graph and returned.
    ///
    /// A reverse (`b -> a`) or duplicate relation for a pair already seen
    /// folds into that pair's record: confidence becomes the maximum,
    /// `relation_id` stays the first relation met and the others land in
    /// `merged_relation_ids`.
    pub fn detect_contradictions(&self) -> Vec<Contradiction> {
        let mut state = self.state.write();
        let now = Utc::now();
        let mut found: Vec<Contradiction> = Vec::new();
        let mut by_pair: HashMap<String, usize> = HashMap::new();

        for relation in state
            .relations
            .visible(None)
            .filter(|r| r.kind == RelationKind::Contradicts)
        {
            let (Some(first), Some(second)) = (
                state.entities.current(&relation.source_id),
                state.entities.current(&relation.target_id),
            ) else {
                continue;
            };
            let id = contradiction_id(&first.id, &second.id);
            if let Some(&slot) = by_pair.get(&id) {
                let record = &mut found[slot];
                record.confidence = record.confidence.max(relation.confidence);
                record.merged_relation_ids.push(relation.id.clone());
                continue;
            }
            by_pair.insert(id.clone(), found.len());
            found.push(Contradiction {
                id,
                entity1_id: first.id.clone(),
                entity2_id: second.id.clone(),
                contradiction_type: EXPLICIT_CONTRADICTION.to_string(),
                confidence: relation.confidence,
                explanation: format!("{} contradicts {}", first.name, second.name),
                detected_at: now,
                relation_id: relation.id.clone(),
                merged_relation_ids: Vec::new(),
            });
        }

        for record in &found {
            state.store_contradiction(record.clone());
        }
        if !found.is_empty() {
            info!(count = found.len(), "Contradictions detected");
        }
        found
    }

    /// Contradictions recorded so far.
    pub fn contradictions(&self) -> Vec<Contradiction> {
        let state = self.state.read();
        state
            .contradiction_order
            .iter()
            .filter_map(|id| state.contradictions.get(id).cloned())
            .collect()
    }

    pub fn stats(&self) -> SegStats {
        let state = self.state.read();
        SegStats {
            entity_count: state.entities.visible(None).count(),
            entity_versions: state.entities.all_versions().count(),
            relation_count: state.relations.visible(None).count(),
            evidence_count: state.evidence.visible(None).count(),
            contradiction_count: state.contradictions.len(),
        }
    }

    // -- persistence --------------------------------------------------------

    pub fn export(&self) -> SegExport {
        let stats = self.stats();
        let state = self.state.read();
        SegExport {
            entities: state.entities.all_versions().cloned().collect(),
            relations: state.relations.all_versions().cloned().collect(),
            evidence: state.evidence.all_versions().cloned().collect(),
            contradictions: state
                .contradiction_order
                .iter()
                .filter_map(|id| state.contradictions.get(id).cloned())
                .collect(),
            stats,
        }
    }

    /// Rebuild a graph from an export, keeping every version.
    pub fn import(data: SegExport) -> AimosResult<Self> {
        let mut state = GraphState::default();
        for entity in data.entities {
            state.entities.push(&entity.id.clone(), entity);
        }
        for relation in data.relations {
            for id in [&relation.source_id, &relation.target_id] {
                if !state.entities.contains(id) {
                    return Err(AimosError::Validation(format!(
                        "relation {} references unknown entity {id}",
                        relation.id
                    )));
                }
            }
            state.relations.push(&relation.id.clone(), relation);
        }
        for evidence in data.evidence {
            state.evidence.push(&evidence.id.clone(), evidence);
        }
        for record in data.contradictions {
            state.store_contradiction(record);
        }
        Ok(Self {
            state: RwLock::new(state),
            catalog: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn graph_with(names: &[&str]) -> SegGraph {
        let graph = SegGraph::new();
        for name in names {
            graph.add_entity(Entity::new(*name, "claim", *name, t0())).unwrap();
        }
        graph
    }

    struct Catalog;

    impl AtomCatalog for Catalog {
        fn atom_created_at(&self, atom_id: &str) -> AimosResult<Option<DateTime<Utc>>> {
            Ok((atom_id == "atom-1").then(t0))
        }
    }

    #[test]
    fn test_add_entity_is_idempotent_and_assigns_ids() {
        let graph = SegGraph::new();
        let first = graph.add_entity(Entity::new("e", "claim", "first", t0())).unwrap();
        let again = graph.add_entity(Entity::new("e", "claim", "second", t0())).unwrap();
        assert_eq!(first, again);

        let fresh = graph.add_entity(Entity::new("", "claim", "anon", t0())).unwrap();
        assert!(Uuid::parse_str(&fresh.id).is_ok());
        assert_eq!(graph.stats().entity_count, 2);

        let mut bad = Entity::new("x", "claim", "x", t0());
        bad.confidence = 1.5;
        assert_eq!(graph.add_entity(bad).unwrap_err().kind(), "validation_error");
    }

    #[test]
    fn test_update_entity_versions() {
        let graph = graph_with(&["e"]);
        let patch = EntityPatch {
            name: Some("renamed".into()),
            attributes: [("field".to_string(), serde_json::json!("ai"))].into_iter().collect(),
            ..Default::default()
        };
        let updated = graph.update_entity("e", patch).unwrap().unwrap();
        assert_eq!(updated.name, "renamed");

        let history = graph.get_entity_history("e");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].tt_end, Some(history[1].tt_start));
        assert!(history[1].tt_start > history[0].tt_start);

        let before = graph.get_entity("e", Some(t0())).unwrap();
        assert_eq!(before.name, "e");
        assert_eq!(graph.get_entity("e", None).unwrap().name, "renamed");
        assert!(graph.update_entity("missing", EntityPatch::default()).unwrap().is_none());
    }

    #[test]
    fn test_relation_requires_endpoints() {
        let graph = graph_with(&["a"]);
        let err = graph
            .add_relation(Relation::new("r", "a", "b", RelationKind::Supports, t0()))
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(graph.get_relations(&RelationQuery::default()).is_empty());
    }

    #[test]
    fn test_reads_of_unknown_ids_are_empty() {
        let graph = SegGraph::new();
        assert!(graph.get_entity("nope", None).is_none());
        assert!(graph.get_entity_history("nope").is_empty());
        assert!(graph.trace_provenance("nope", 3).is_empty());
        assert!(graph.get_evidence("nope").is_none());
        assert!(graph.retract_relation("nope").is_none());
    }

    #[test]
    fn test_query_at_counts_versions_in_force() {
        let graph = graph_with(&["a", "b"]);
        graph
            .add_relation(Relation::new("r", "a", "b", RelationKind::References, t0()))
            .unwrap();
        graph.add_evidence(Evidence::new("ev", "log line", "ops", t0())).unwrap();

        let before = graph.query_at(t0() - Duration::seconds(1));
        assert_eq!(before.entity_count, 0);
        let slice = graph.query_at(t0() + Duration::seconds(1));
        assert_eq!((slice.entity_count, slice.relation_count, slice.evidence_count), (2, 1, 1));

        let retracted = graph.retract_relation("r").unwrap();
        assert!(retracted.tt_end.is_some());
        assert!(graph.get_relation("r").is_none());
        assert_eq!(graph.query_at(t0() + Duration::seconds(1)).relation_count, 1);
    }

    #[test]
    fn test_contradictions_one_per_pair() {
        let graph = graph_with(&["a", "b"]);
        let mut forward = Relation::new("r1", "a", "b", RelationKind::Contradicts, t0());
        forward.confidence = 0.4;
        let mut backward = Relation::new("r2", "b", "a", RelationKind::Contradicts, t0());
        backward.confidence = 0.7;
        graph.add_relation(forward).unwrap();
        graph.add_relation(backward).unwrap();

        let found = graph.detect_contradictions();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].contradiction_type, EXPLICIT_CONTRADICTION);
        assert_eq!(found[0].confidence, 0.7);
        assert_eq!(found[0].explanation, "a contradicts b");
        let mut folded = vec![found[0].relation_id.clone()];
        folded.extend(found[0].merged_relation_ids.iter().cloned());
        folded.sort();
        assert_eq!(folded, vec!["r1", "r2"]);

        // Re-running replaces rather than duplicates.
        graph.detect_contradictions();
        assert_eq!(graph.contradictions().len(), 1);
        assert_eq!(graph.stats().contradiction_count, 1);
    }

    #[test]
    fn test_evidence_catalog_check() {
        let graph = SegGraph::new().with_catalog(Arc::new(Catalog));
        let mut backed = Evidence::new("ev1", "quote", "doc", t0() + Duration::hours(1));
        backed.atom_id = Some("atom-1".into());
        graph.add_evidence(backed).unwrap();

        let mut early = Evidence::new("ev2", "quote", "doc", t0() - Duration::hours(1));
        early.atom_id = Some("atom-1".into());
        assert!(graph.add_evidence(early).is_err());

        let mut unknown = Evidence::new("ev3", "quote", "doc", t0());
        unknown.atom_id = Some("atom-9".into());
        assert!(graph.add_evidence(unknown).is_err());
        assert_eq!(graph.list_evidence(None).len(), 1);
    }

    #[test]
    fn test_export_import_round_trip() {
        let graph = graph_with(&["a", "b"]);
        graph
            .add_relation(Relation::new("r", "a", "b", RelationKind::Contradicts, t0()))
            .unwrap();
        graph
            .update_entity("a", EntityPatch {
                confidence: Some(0.5),
                ..Default::default()
            })
            .unwrap();
        graph.detect_contradictions();

        let export = graph.export();
        let json = serde_json::to_string(&export).unwrap();
        let restored = SegGraph::import(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(restored.export(), export);
        assert_eq!(restored.get_entity_history("a").len(), 2);

        let mut broken = export.clone();
        broken.entities.retain(|e| e.id != "b");
        assert!(SegGraph::import(broken).is_err());
    }
}
