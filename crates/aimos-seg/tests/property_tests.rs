//! Property-based and scenario tests for aimos-seg.

use aimos_seg::SegGraph;
use aimos_types::seg::{Entity, Relation, RelationKind};
use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

const KINDS: [RelationKind; 5] = [
    RelationKind::Supports,
    RelationKind::Contradicts,
    RelationKind::References,
    RelationKind::DerivesFrom,
    RelationKind::RelatesTo,
];

/// `(source, target, kind index)` over a small entity pool.
fn arb_edges(entities: usize) -> impl Strategy<Value = Vec<(usize, usize, usize)>> {
    prop::collection::vec((0..entities, 0..entities, 0..KINDS.len()), 0..24)
}

fn build(entities: usize, edges: &[(usize, usize, usize)]) -> SegGraph {
    let graph = SegGraph::new();
    for i in 0..entities {
        graph
            .add_entity(Entity::new(format!("e{i}"), "claim", format!("claim {i}"), t0()))
            .unwrap();
    }
    for (n, (source, target, kind)) in edges.iter().enumerate() {
        graph
            .add_relation(Relation::new(
                format!("r{n}"),
                format!("e{source}"),
                format!("e{target}"),
                KINDS[*kind],
                t0(),
            ))
            .unwrap();
    }
    graph
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn prop_one_contradiction_per_contradicting_pair(edges in arb_edges(6)) {
        let graph = build(6, &edges);
        let found = graph.detect_contradictions();

        for (source, target, kind) in &edges {
            if KINDS[*kind] != RelationKind::Contradicts {
                continue;
            }
            let (a, b) = (format!("e{source}"), format!("e{target}"));
            let matching = found
                .iter()
                .filter(|c| {
                    (c.entity1_id == a && c.entity2_id == b) || (c.entity1_id == b && c.entity2_id == a)
                })
                .count();
            prop_assert_eq!(matching, 1);
        }
        let contradicting = edges.iter().filter(|(_, _, k)| KINDS[*k] == RelationKind::Contradicts).count();
        prop_assert!(found.len() <= contradicting);
    }

    #[test]
    fn prop_provenance_bounded_by_depth(edges in arb_edges(8), start in 0usize..8, depth in 0usize..6) {
        let graph = build(8, &edges);
        let trail = graph.trace_provenance(&format!("e{start}"), depth);
        prop_assert!(trail.len() <= depth);
        for (ancestor, relation) in &trail {
            prop_assert_eq!(relation.kind, RelationKind::DerivesFrom);
            prop_assert_eq!(&relation.source_id, &ancestor.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn provenance_chain_walks_back_in_order() {
    let graph = SegGraph::new();
    for name in ["raw", "processed", "analyzed", "conclusion"] {
        graph.add_entity(Entity::new(name, "artifact", name, t0())).unwrap();
    }
    for (n, (from, to)) in [("raw", "processed"), ("processed", "analyzed"), ("analyzed", "conclusion")]
        .into_iter()
        .enumerate()
    {
        graph
            .add_relation(Relation::new(format!("d{n}"), from, to, RelationKind::DerivesFrom, t0()))
            .unwrap();
    }

    let trail = graph.trace_provenance("conclusion", 3);
    let ancestors: Vec<&str> = trail.iter().map(|(e, _)| e.id.as_str()).collect();
    assert_eq!(ancestors, vec!["analyzed", "processed", "raw"]);
    assert!(trail.iter().all(|(_, r)| r.kind == RelationKind::DerivesFrom));

    assert_eq!(graph.trace_provenance("conclusion", 1).len(), 1);
    assert!(graph.trace_provenance("raw", 3).is_empty());
}

#[test]
fn provenance_survives_cycles() {
    let graph = SegGraph::new();
    for name in ["a", "b"] {
        graph.add_entity(Entity::new(name, "claim", name, t0())).unwrap();
    }
    graph
        .add_relation(Relation::new("ab", "a", "b", RelationKind::DerivesFrom, t0()))
        .unwrap();
    graph
        .add_relation(Relation::new("ba", "b", "a", RelationKind::DerivesFrom, t0()))
        .unwrap();
    let trail = graph.trace_provenance("a", 10);
    assert_eq!(trail.len(), 2);
}
