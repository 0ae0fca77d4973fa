//! Two-stage retrieval.
//!
//! coarse search → DVNS refinement → dedup → conflict resolution → budget →
//! optional compression. The retriever only reads the index.

use crate::budget::{BudgetAudit, BudgetItem, TokenBudgetManager};
use crate::compress::{AgeCompressor, Compressor};
use crate::conflict::{ConflictRecord, ConflictResolver};
use crate::dedup::{DedupRecord, Deduplicator};
use crate::dvns::{DvnsPhysics, ParticleSeed, Termination};
use crate::search::SemanticSearchEngine;
use crate::text::count_tokens;
use aimos_types::config::RetrievalConfig;
use aimos_types::{AimosError, AimosResult};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Stage-by-stage record of one retrieval.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalAudit {
    pub query: String,
    pub dvns_enabled: bool,
    pub after_relevance_floor: usize,
    pub after_dvns: usize,
    pub dvns_termination: Option<Termination>,
    pub after_dedup: usize,
    pub after_conflicts: usize,
    pub dedup_records: Vec<DedupRecord>,
    pub budget: Option<BudgetAudit>,
}

/// Outcome of [`TwoStageRetriever::retrieve`].
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub selected_items: Vec<BudgetItem>,
    pub total_tokens: usize,
    pub coarse_candidates: usize,
    pub coarse_time_ms: f64,
    pub dvns_iterations: usize,
    pub dvns_converged: bool,
    pub dvns_time_ms: f64,
    /// Mean coarse relevance of the selected items.
    pub relevance_score: f64,
    /// Summed relevance per token.
    pub efficiency: f64,
    /// Lift over the non-DVNS baseline, when one was computed.
    pub rs_lift: Option<f64>,
    pub excluded_count: usize,
    pub excluded_high_relevance: usize,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    pub conflict_records: Vec<ConflictRecord>,
    pub duplicates_removed: usize,
    pub compression_applied: bool,
    pub tokens_saved_by_compression: usize,
    pub compression_ratio: f64,
    pub audit_trail: RetrievalAudit,
}

/// `(dvns - base) / base`, 0 when the baseline has no relevance.
pub fn relevance_lift(dvns: f64, base: f64) -> f64 {
    if base <= 0.0 {
        0.0
    } else {
        (dvns - base) / base
    }
}

pub struct TwoStageRetriever {
    search: Arc<SemanticSearchEngine>,
    config: RetrievalConfig,
    physics: DvnsPhysics,
    dedup: Deduplicator,
    conflicts: ConflictResolver,
    compressor: Arc<dyn Compressor>,
}

impl TwoStageRetriever {
    pub fn new(search: Arc<SemanticSearchEngine>, config: RetrievalConfig) -> Self {
        Self {
            physics: DvnsPhysics::new(config.dvns.clone()),
            dedup: Deduplicator::new(config.dedup.clone()),
            conflicts: ConflictResolver::new(config.conflict.clone()),
            compressor: Arc::new(AgeCompressor::new(config.compression.clone())),
            search,
            config,
        }
    }

    /// Swap the compression stage.
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub async fn retrieve(
        &self,
        query: &str,
        token_budget: usize,
        provider: Option<&str>,
    ) -> AimosResult<RetrievalResult> {
        self.run(query, token_budget, provider, true).await
    }

    /// Run with and without DVNS over the same inputs; returns `(dvns, baseline, lift)`.
    pub async fn retrieve_with_baseline_comparison(
        &self,
        query: &str,
        token_budget: usize,
        provider: Option<&str>,
    ) -> AimosResult<(RetrievalResult, RetrievalResult, f64)> {
        let mut dvns = self.run(query, token_budget, provider, true).await?;
        let baseline = self.run(query, token_budget, provider, false).await?;
        let lift = relevance_lift(dvns.relevance_score, baseline.relevance_score);
        dvns.rs_lift = Some(lift);
        info!(
            query,
            dvns_relevance = dvns.relevance_score,
            baseline_relevance = baseline.relevance_score,
            rs_lift = lift,
            "Baseline comparison finished"
        );
        Ok((dvns, baseline, lift))
    }

    async fn run(
        &self,
        query: &str,
        token_budget: usize,
        provider: Option<&str>,
        use_dvns: bool,
    ) -> AimosResult<RetrievalResult> {
        if query.trim().is_empty() {
            return Err(AimosError::validation("query must be non-empty"));
        }
        if token_budget == 0 {
            return Err(AimosError::validation("token budget must be positive"));
        }
        let cfg = &self.config;
        let mut audit = RetrievalAudit {
            query: query.to_string(),
            dvns_enabled: use_dvns,
            ..RetrievalAudit::default()
        };

        let coarse_start = Instant::now();
        let query_vec = self.search.embed_query(query, provider).await?;
        let hits = self.search.rank(&query_vec, cfg.level, cfg.coarse_k.max(1), None);
        let coarse_time_ms = coarse_start.elapsed().as_secs_f64() * 1_000.0;
        let coarse_candidates = hits.len();

        let mut candidates: Vec<BudgetItem> = hits
            .into_iter()
            .filter(|h| h.score >= cfg.min_relevance)
            .map(|hit| {
                let node = hit.node;
                let mut metadata = node.metadata;
                metadata.insert("node_id".into(), json!(node.id));
                metadata.insert("coarse_score".into(), json!(hit.score));
                metadata.insert("search_confidence".into(), json!(hit.confidence));
                BudgetItem {
                    id: node.id,
                    token_count: count_tokens(&node.content),
                    content: node.content,
                    relevance: hit.score,
                    source_id: node.doc_id,
                    level: node.level,
                    metadata,
                    embedding: Some(node.embedding),
                }
            })
            .collect();
        audit.after_relevance_floor = candidates.len();

        let mut dvns_iterations = 0;
        let mut dvns_converged = false;
        let mut dvns_time_ms = 0.0;
        if use_dvns && !candidates.is_empty() {
            let dvns_start = Instant::now();
            let seeds = candidates
                .iter()
                .map(|c| ParticleSeed {
                    id: c.id.clone(),
                    content: c.content.clone(),
                    embedding: c.embedding.clone().unwrap_or_default(),
                    relevance: c.relevance,
                    metadata: c.metadata.clone(),
                })
                .collect();
            let mut particles = self.physics.create_particles(seeds, &query_vec);
            let metrics = self.physics.simulate(&mut particles, &query_vec)?;
            dvns_iterations = metrics.iterations;
            dvns_converged = metrics.converged;
            audit.dvns_termination = Some(metrics.termination);

            let scale = cfg.anchor_scale.max(1e-9);
            let refined: HashMap<String, (f64, f64)> = particles
                .iter()
                .map(|p| {
                    let distance = p.anchor_distance();
                    (p.id.clone(), (p.relevance * (-distance / scale).exp(), distance))
                })
                .collect();
            let best = refined.values().map(|r| r.0).fold(0.0, f64::max);
            let floor = best * cfg.dvns_keep_ratio;
            candidates.retain(|c| refined.get(&c.id).is_some_and(|r| r.0 >= floor));
            for c in &mut candidates {
                if let Some((score, distance)) = refined.get(&c.id) {
                    c.metadata.insert("refined_relevance".into(), json!(score));
                    c.metadata.insert("anchor_distance".into(), json!(distance));
                }
            }
            let refined_of = |c: &BudgetItem| refined.get(&c.id).map_or(0.0, |r| r.0);
            candidates.sort_by(|a, b| refined_of(b).total_cmp(&refined_of(a)));
            if let Some(k) = cfg.top_k_after_dvns {
                candidates.truncate(k);
            }
            dvns_time_ms = dvns_start.elapsed().as_secs_f64() * 1_000.0;
        }
        audit.after_dvns = candidates.len();

        let deduped = self.dedup.dedup(candidates);
        audit.after_dedup = deduped.items.len();
        audit.dedup_records = deduped.audit_trail;
        let duplicates_removed = deduped.metrics.duplicates_removed;

        let (candidates, conflict_records, conflicts_detected, conflicts_resolved) =
            if cfg.conflict.enabled {
                let resolved = self.conflicts.resolve(deduped.items);
                (
                    resolved.items,
                    resolved.records,
                    resolved.metrics.conflicts_detected,
                    resolved.metrics.conflicts_resolved,
                )
            } else {
                (deduped.items, Vec::new(), 0, 0)
            };
        audit.after_conflicts = candidates.len();

        // Keep pipeline order for the final selection.
        let position: HashMap<String, usize> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.clone(), i))
            .collect();
        let budget = TokenBudgetManager::new(cfg.strategy)
            .with_regret_threshold(cfg.regret_threshold)
            .allocate(candidates, token_budget, Some(cfg.min_relevance))?;
        let excluded_count = budget.excluded.len();
        let excluded_high_relevance = budget.audit_trail.excluded_high_relevance.len();
        audit.budget = Some(budget.audit_trail);
        let mut selected = budget.included;
        selected.sort_by_key(|c| position.get(&c.id).copied().unwrap_or(usize::MAX));

        let (selected, compression_applied, tokens_saved, compression_ratio) =
            if cfg.compression.enabled && !selected.is_empty() {
                let outcome = self.compressor.compress(selected, Utc::now());
                let applied = outcome.compressed_items > 0;
                (outcome.items, applied, outcome.tokens_saved, outcome.ratio)
            } else {
                (selected, false, 0, 1.0)
            };

        let total_tokens: usize = selected.iter().map(|c| c.token_count).sum();
        let relevance_sum: f64 = selected.iter().map(|c| c.relevance).sum();
        let relevance_score = if selected.is_empty() {
            0.0
        } else {
            relevance_sum / selected.len() as f64
        };
        let efficiency = if total_tokens > 0 {
            relevance_sum / total_tokens as f64
        } else {
            0.0
        };
        info!(
            query,
            dvns = use_dvns,
            coarse_candidates,
            selected = selected.len(),
            total_tokens,
            relevance_score,
            "Retrieval finished"
        );

        Ok(RetrievalResult {
            selected_items: selected,
            total_tokens,
            coarse_candidates,
            coarse_time_ms,
            dvns_iterations,
            dvns_converged,
            dvns_time_ms,
            relevance_score,
            efficiency,
            rs_lift: None,
            excluded_count,
            excluded_high_relevance,
            conflicts_detected,
            conflicts_resolved,
            conflict_records,
            duplicates_removed,
            compression_applied,
            tokens_saved_by_compression: tokens_saved,
            compression_ratio,
            audit_trail: audit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{HashingEmbedder, ProviderRegistry};
    use crate::index::HierarchicalIndex;

    async fn retriever(config: RetrievalConfig) -> TwoStageRetriever {
        let provider = Arc::new(HashingEmbedder::new(256));
        let index = Arc::new(HierarchicalIndex::new(provider.clone()));
        index
            .index_document(
                "Atoms are immutable records.\n\nSnapshots hash the ordered atom ids.\n\nJournals carry a checksum per line.",
                "doc",
            )
            .await
            .unwrap();
        let search = SemanticSearchEngine::new(index, ProviderRegistry::single(provider));
        TwoStageRetriever::new(Arc::new(search), config)
    }

    #[test]
    fn test_lift_formula() {
        assert_eq!(relevance_lift(0.6, 0.3), 1.0);
        assert_eq!(relevance_lift(0.6, 0.0), 0.0);
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let r = retriever(RetrievalConfig::default()).await;
        let err = r.retrieve("  ", 100, None).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn test_min_relevance_is_absolute() {
        let config = RetrievalConfig {
            min_relevance: 0.99,
            ..RetrievalConfig::default()
        };
        let r = retriever(config).await;
        let result = r.retrieve("snapshots hash", 100, None).await.unwrap();
        assert!(result.selected_items.is_empty());
        assert!(result.coarse_candidates > 0);
        assert_eq!(result.relevance_score, 0.0);
    }

    #[tokio::test]
    async fn test_retrieve_respects_budget() {
        let config = RetrievalConfig {
            min_relevance: 0.05,
            ..RetrievalConfig::default()
        };
        let r = retriever(config).await;
        let result = r.retrieve("snapshots hash atom ids", 500, None).await.unwrap();
        assert!(!result.selected_items.is_empty());
        assert!(result.total_tokens <= 500);
        assert_eq!(result.selected_items[0].id, "para:doc:0:1");
        assert!(result.dvns_iterations > 0);
        assert!(result.rs_lift.is_none());
    }
}
