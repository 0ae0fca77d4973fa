//! End-to-end retrieval scenarios: buried facts, budget ceilings, stance conflicts.

use std::sync::Arc;

use aimos_hhni::budget::{BudgetItem, TokenBudgetManager};
use aimos_hhni::conflict::ConflictResolver;
use aimos_hhni::embedding::{HashingEmbedder, ProviderRegistry};
use aimos_hhni::index::HierarchicalIndex;
use aimos_hhni::retrieval::TwoStageRetriever;
use aimos_hhni::search::SemanticSearchEngine;
use aimos_types::config::{BudgetStrategy, ConflictConfig, RetrievalConfig};
use aimos_types::index::IndexLevel;
use chrono::{Duration, Utc};
use serde_json::json;

const GUIDE: &str = "# Overview
This guide gives general information about the deployment.
Operators read it before the first rollout.

# Installation
Install the packages and configure the service.
Keep the information in the config file current.

# Internals
The storage layer writes journals.

IMPORTANT: the critical information is buried here.

# Appendix
Further reading and links live in this appendix.";

async fn guide_retriever(config: RetrievalConfig) -> TwoStageRetriever {
    let provider = Arc::new(HashingEmbedder::new(256));
    let index = Arc::new(HierarchicalIndex::new(provider.clone()));
    index.index_document(GUIDE, "guide").await.unwrap();
    let search = SemanticSearchEngine::new(index, ProviderRegistry::single(provider));
    TwoStageRetriever::new(Arc::new(search), config)
}

#[tokio::test]
async fn test_buried_fact_beats_baseline() {
    let config = RetrievalConfig {
        min_relevance: 0.1,
        ..RetrievalConfig::default()
    };
    let retriever = guide_retriever(config).await;
    let (dvns, baseline, lift) = retriever
        .retrieve_with_baseline_comparison("critical information", 500, None)
        .await
        .unwrap();

    assert!(
        dvns.relevance_score > baseline.relevance_score,
        "dvns {} vs baseline {}",
        dvns.relevance_score,
        baseline.relevance_score
    );
    assert!(lift > 0.0);
    assert_eq!(dvns.rs_lift, Some(lift));
    assert!(dvns
        .selected_items
        .iter()
        .any(|item| item.metadata.get("section_index") == Some(&json!(2))));
    assert!(dvns.total_tokens <= 500);
    assert!(dvns.dvns_iterations > 0);
    assert_eq!(baseline.dvns_iterations, 0);
}

#[tokio::test]
async fn test_empty_query_fails_validation() {
    let retriever = guide_retriever(RetrievalConfig::default()).await;
    let err = retriever.retrieve("", 500, None).await.unwrap_err();
    assert_eq!(err.kind(), "validation_error");
}

#[test]
fn test_budget_ceiling() {
    let items: Vec<BudgetItem> = (0..10)
        .map(|i| {
            BudgetItem::new(
                format!("item-{i}"),
                format!("content {i}"),
                0.99 - 0.01 * i as f64,
                "src",
                IndexLevel::Paragraph,
            )
            .with_tokens(10)
        })
        .collect();
    let result = TokenBudgetManager::new(BudgetStrategy::Greedy)
        .allocate(items, 50, None)
        .unwrap();

    assert_eq!(result.included.len(), 5);
    assert_eq!(result.total_tokens_used, 50);
    let expected = (0.99 + 0.98 + 0.97 + 0.96 + 0.95) / 50.0;
    assert!((result.efficiency - expected).abs() < 1e-9);
    assert_eq!(result.audit_trail.utilization, 1.0);
}

fn claim(id: &str, stance: &str, days_ago: i64) -> BudgetItem {
    BudgetItem::new(id, format!("beta is {stance}"), 0.8, "src", IndexLevel::Paragraph)
        .with_metadata("topic", json!("beta stability"))
        .with_metadata("stance", json!(stance))
        .with_metadata("confidence", json!(0.6))
        .with_metadata(
            "timestamp",
            json!((Utc::now() - Duration::days(days_ago)).to_rfc3339()),
        )
}

#[test]
fn test_more_recent_stance_wins() {
    let resolver = ConflictResolver::new(ConflictConfig {
        recency_bias: 0.4,
        ..ConflictConfig::default()
    });

    let result = resolver.resolve(vec![claim("supports-1", "supports", 1), claim("refutes-1", "refutes", 0)]);
    assert_eq!(result.items.len(), 1);
    assert_eq!(result.items[0].id, "refutes-1");
    assert_eq!(result.records[0].suppressed_ids, vec!["supports-1".to_string()]);
    assert_eq!(result.records[0].winning_stance, "refutes");

    let result = resolver.resolve(vec![claim("supports-2", "supports", 0), claim("refutes-2", "refutes", 1)]);
    assert_eq!(result.items[0].id, "supports-2");
    assert_eq!(result.records[0].suppressed_ids, vec!["refutes-2".to_string()]);
    assert_eq!(result.metrics.conflicts_resolved, 1);
}
