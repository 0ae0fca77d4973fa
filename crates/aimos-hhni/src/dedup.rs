//! Near-duplicate folding.
//!
//! Candidates are clustered against each cluster's leader. Each cluster keeps
//! its best-ranked member under `relevance + recency_bias * recency +
//! authority_bias * authority`, with recency and authority min-max normalised
//! over the cluster. Passes repeat until nothing merges, so running the
//! deduplicator on its own output changes nothing.

use crate::budget::BudgetItem;
use crate::embedding::cosine_similarity;
use crate::text::word_tokens;
use aimos_types::canonical::parse_ts;
use aimos_types::config::DedupConfig;
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

const TIMESTAMP_KEYS: [&str; 4] = ["timestamp", "created_at", "recorded_at", "date"];
const AUTHORITY_KEYS: [&str; 3] = ["confidence", "authority", "evidence"];

/// Metadata timestamp as seconds since the epoch.
pub(crate) fn recency_value(item: &BudgetItem) -> Option<f64> {
    TIMESTAMP_KEYS.iter().find_map(|k| match item.metadata.get(*k)? {
        serde_json::Value::String(s) => parse_ts(s).ok().map(|t| t.timestamp_micros() as f64 / 1e6),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    })
}

/// Confidence-like metadata, 0 when absent.
pub(crate) fn authority_value(item: &BudgetItem) -> f64 {
    AUTHORITY_KEYS
        .iter()
        .find_map(|k| item.metadata.get(*k).and_then(|v| v.as_f64()))
        .unwrap_or(0.0)
}

fn min_max(values: &[f64]) -> Vec<f64> {
    let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = hi - lo;
    values
        .iter()
        .map(|v| if range > 1e-12 { (v - lo) / range } else { 0.0 })
        .collect()
}

/// Weighted rank of each item, normalised within `items`.
pub(crate) fn weighted_scores(items: &[&BudgetItem], recency_bias: f64, authority_bias: f64) -> Vec<f64> {
    let recency: Vec<f64> = items.iter().map(|i| recency_value(i).unwrap_or(0.0)).collect();
    let authority: Vec<f64> = items.iter().map(|i| authority_value(i)).collect();
    let recency = min_max(&recency);
    let authority = min_max(&authority);
    items
        .iter()
        .enumerate()
        .map(|(k, i)| i.relevance + recency_bias * recency[k] + authority_bias * authority[k])
        .collect()
}

/// Index of the best score; earlier wins ties.
pub(crate) fn best_index(scores: &[f64]) -> usize {
    let mut best = 0;
    for (k, s) in scores.iter().enumerate() {
        if *s > scores[best] + 1e-12 {
            best = k;
        }
    }
    best
}

fn embedding_of(item: &BudgetItem) -> Option<Vec<f32>> {
    if let Some(values) = item.metadata.get("embedding").and_then(|v| v.as_array()) {
        let parsed: Option<Vec<f32>> = values.iter().map(|v| v.as_f64().map(|f| f as f32)).collect();
        if let Some(vector) = parsed.filter(|v| !v.is_empty()) {
            return Some(vector);
        }
    }
    item.embedding.clone().filter(|v| !v.is_empty())
}

fn jaccard(a: &str, b: &str) -> f64 {
    let a: HashSet<String> = word_tokens(a).into_iter().collect();
    let b: HashSet<String> = word_tokens(b).into_iter().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let union = a.union(&b).count();
    a.intersection(&b).count() as f64 / union as f64
}

/// Cosine over embeddings when both sides have one, token Jaccard otherwise.
pub fn similarity(a: &BudgetItem, b: &BudgetItem) -> f64 {
    match (embedding_of(a), embedding_of(b)) {
        (Some(x), Some(y)) if x.len() == y.len() => f64::from(cosine_similarity(&x, &y)),
        _ => jaccard(&a.content, &b.content),
    }
}

/// One merged cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DedupRecord {
    pub cluster_id: usize,
    pub representative_id: String,
    pub merged_ids: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DedupMetrics {
    pub total_candidates: usize,
    pub duplicates_removed: usize,
    pub threshold_used: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupResult {
    pub items: Vec<BudgetItem>,
    pub audit_trail: Vec<DedupRecord>,
    pub metrics: DedupMetrics,
}

#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    pub fn dedup(&self, items: Vec<BudgetItem>) -> DedupResult {
        let total = items.len();
        let mut current = items;
        let mut audit = Vec::new();
        loop {
            let before = current.len();
            current = self.pass(current, &mut audit);
            if current.len() == before {
                break;
            }
        }
        let removed = total - current.len();
        if removed > 0 {
            debug!(total, removed, "Folded near-duplicates");
        }
        DedupResult {
            items: current,
            audit_trail: audit,
            metrics: DedupMetrics {
                total_candidates: total,
                duplicates_removed: removed,
                threshold_used: self.config.similarity_threshold,
            },
        }
    }

    fn pass(&self, items: Vec<BudgetItem>, audit: &mut Vec<DedupRecord>) -> Vec<BudgetItem> {
        let cap = self.config.max_cluster_size.max(1);
        let mut clusters: Vec<Vec<usize>> = Vec::new();
        for idx in 0..items.len() {
            let home = clusters.iter_mut().find(|members| {
                members.len() < cap
                    && similarity(&items[members[0]], &items[idx]) >= self.config.similarity_threshold
            });
            match home {
                Some(members) => members.push(idx),
                None => clusters.push(vec![idx]),
            }
        }

        let mut keep = Vec::with_capacity(clusters.len());
        for members in &clusters {
            if members.len() == 1 {
                keep.push(members[0]);
                continue;
            }
            let group: Vec<&BudgetItem> = members.iter().map(|&m| &items[m]).collect();
            let scores = weighted_scores(&group, self.config.recency_bias, self.config.authority_bias);
            let winner = members[best_index(&scores)];
            audit.push(DedupRecord {
                cluster_id: audit.len(),
                representative_id: items[winner].id.clone(),
                merged_ids: members
                    .iter()
                    .filter(|&&m| m != winner)
                    .map(|&m| items[m].id.clone())
                    .collect(),
                reason: format!("similarity >= {:.2}", self.config.similarity_threshold),
            });
            keep.push(winner);
        }

        let keep: HashSet<usize> = keep.into_iter().collect();
        items
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| keep.contains(idx))
            .map(|(_, item)| item)
            .collect()
    }
}
