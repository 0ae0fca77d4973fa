//! Coarse semantic search over one level of the index.

use crate::embedding::{cosine_similarity, ProviderRegistry};
use crate::index::{HierarchicalIndex, IndexNode};
use aimos_types::index::IndexLevel;
use aimos_types::{AimosError, AimosResult};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Caller predicate applied to candidate nodes.
pub type NodeFilter<'a> = &'a (dyn Fn(&IndexNode) -> bool + Send + Sync);

/// One ranked hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub node: IndexNode,
    /// Cosine similarity to the query.
    pub score: f64,
    /// Score mapped to [0, 1] within this result set, monotone with score.
    pub confidence: f64,
}

/// Cosine-similarity search against index embeddings.
pub struct SemanticSearchEngine {
    index: Arc<HierarchicalIndex>,
    providers: ProviderRegistry,
    timeout: Duration,
}

impl SemanticSearchEngine {
    pub fn new(index: Arc<HierarchicalIndex>, providers: ProviderRegistry) -> Self {
        Self {
            index,
            providers,
            timeout: Duration::from_secs(10),
        }
    }

    /// Budget for the query embedding call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn index(&self) -> &Arc<HierarchicalIndex> {
        &self.index
    }

    /// Embed `query` with the named provider (default when `None`).
    pub async fn embed_query(&self, query: &str, provider: Option<&str>) -> AimosResult<Vec<f32>> {
        if query.trim().is_empty() {
            return Err(AimosError::validation("query must be non-empty"));
        }
        let provider = self.providers.get(provider).ok_or_else(|| {
            AimosError::Validation(format!(
                "unknown embedding provider '{}'",
                provider.unwrap_or_default()
            ))
        })?;
        let expected = self.index.provider().dimensions();
        if provider.dimensions() != expected {
            return Err(AimosError::Validation(format!(
                "provider '{}' produces {}-dim vectors but the index uses {expected}",
                provider.name(),
                provider.dimensions()
            )));
        }
        tokio::time::timeout(self.timeout, provider.encode_one(query))
            .await
            .map_err(|_| AimosError::Timeout(format!("query embedding exceeded {:?}", self.timeout)))?
            .map_err(AimosError::from)
    }

    /// Top `top_k` nodes at `level` with positive similarity.
    pub async fn search(
        &self,
        query: &str,
        level: IndexLevel,
        top_k: usize,
        filter: Option<NodeFilter<'_>>,
        provider: Option<&str>,
    ) -> AimosResult<Vec<SearchResult>> {
        if top_k == 0 {
            return Err(AimosError::validation("top_k must be positive"));
        }
        let query_vec = self.embed_query(query, provider).await?;
        Ok(self.rank(&query_vec, level, top_k, filter))
    }

    /// Rank with a precomputed query vector.
    pub fn rank(
        &self,
        query_vec: &[f32],
        level: IndexLevel,
        top_k: usize,
        filter: Option<NodeFilter<'_>>,
    ) -> Vec<SearchResult> {
        let mut scored: Vec<(IndexNode, f64)> = Vec::new();
        self.index.scan_level(level, |node| {
            if filter.is_some_and(|f| !f(node)) {
                return;
            }
            let score = f64::from(cosine_similarity(query_vec, &node.embedding));
            if score > 0.0 {
                scored.push((node.clone(), score));
            }
        });
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
        scored.truncate(self.index.query_gates().clamp_results(top_k));

        let max = scored.first().map_or(0.0, |s| s.1);
        let min = scored.last().map_or(0.0, |s| s.1);
        let range = max - min;
        debug!(level = %level, hits = scored.len(), "Semantic search ranked");
        scored
            .into_iter()
            .map(|(node, score)| SearchResult {
                confidence: if range > 1e-9 { (score - min) / range } else { 1.0 },
                node,
                score,
            })
            .collect()
    }
}
