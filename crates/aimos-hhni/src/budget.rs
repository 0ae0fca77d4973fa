//! Token budget manager: picks which candidates fit a context window.

use crate::text::count_tokens;
use aimos_types::config::BudgetStrategy;
use aimos_types::index::IndexLevel;
use aimos_types::{AimosError, AimosResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Default relevance at or above which an excluded item counts as regret.
pub const DEFAULT_REGRET_THRESHOLD: f64 = 0.75;

/// A candidate with a token cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetItem {
    pub id: String,
    pub content: String,
    pub relevance: f64,
    pub token_count: usize,
    pub source_id: String,
    pub level: IndexLevel,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl BudgetItem {
    /// Build an item whose token count is measured from `content`.
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        relevance: f64,
        source_id: impl Into<String>,
        level: IndexLevel,
    ) -> Self {
        let content = content.into();
        Self {
            id: id.into(),
            token_count: count_tokens(&content),
            content,
            relevance,
            source_id: source_id.into(),
            level,
            metadata: BTreeMap::new(),
            embedding: None,
        }
    }

    pub fn with_tokens(mut self, token_count: usize) -> Self {
        self.token_count = token_count;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Participant key for fair sharing: the source document, else the source id.
    pub fn participant(&self) -> &str {
        self.metadata
            .get("doc_id")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.source_id)
    }
}

/// Excluded item worth a second look.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegretEntry {
    pub id: String,
    pub relevance: f64,
    pub token_count: usize,
}

/// What the allocator did and why.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetAudit {
    pub strategy: BudgetStrategy,
    pub candidates_considered: usize,
    pub filtered_below_threshold: usize,
    pub included_count: usize,
    pub excluded_count: usize,
    pub tokens_used: usize,
    pub budget_limit: usize,
    /// tokens_used / budget_limit.
    pub utilization: f64,
    pub remaining: usize,
    pub excluded_high_relevance: Vec<RegretEntry>,
    pub excluded_due_to_budget: usize,
    pub notes: Vec<String>,
}

/// Allocation outcome.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetResult {
    /// Included items in ranking order.
    pub included: Vec<BudgetItem>,
    /// Items that did not fit plus those below the relevance floor.
    pub excluded: Vec<BudgetItem>,
    pub total_tokens_used: usize,
    /// Sum of included relevance per token used.
    pub efficiency: f64,
    pub audit_trail: BudgetAudit,
}

impl BudgetResult {
    pub fn total_relevance(&self) -> f64 {
        self.included.iter().map(|i| i.relevance).sum()
    }

    /// Tokens granted but not spent.
    pub fn unused(&self) -> usize {
        self.audit_trail.remaining
    }
}

/// Chooses items under a token limit.
#[derive(Debug, Clone)]
pub struct TokenBudgetManager {
    strategy: BudgetStrategy,
    regret_threshold: f64,
}

impl Default for TokenBudgetManager {
    fn default() -> Self {
        Self::new(BudgetStrategy::Greedy)
    }
}

impl TokenBudgetManager {
    pub fn new(strategy: BudgetStrategy) -> Self {
        Self {
            strategy,
            regret_threshold: DEFAULT_REGRET_THRESHOLD,
        }
    }

    pub fn with_regret_threshold(mut self, threshold: f64) -> Self {
        self.regret_threshold = threshold;
        self
    }

    pub fn strategy(&self) -> BudgetStrategy {
        self.strategy
    }

    /// Select items from `items` within `budget` tokens.
    pub fn allocate(
        &self,
        items: Vec<BudgetItem>,
        budget: usize,
        min_relevance: Option<f64>,
    ) -> AimosResult<BudgetResult> {
        if budget == 0 {
            return Err(AimosError::validation("token budget must be positive"));
        }
        let considered = items.len();
        let floor = min_relevance.unwrap_or(f64::NEG_INFINITY);
        let (mut ranked, filtered): (Vec<BudgetItem>, Vec<BudgetItem>) =
            items.into_iter().partition(|i| i.relevance >= floor);
        ranked.sort_by(|a, b| {
            b.relevance
                .total_cmp(&a.relevance)
                .then(a.token_count.cmp(&b.token_count))
        });

        let mut notes = Vec::new();
        let picked = match self.strategy {
            BudgetStrategy::Greedy => greedy(&ranked, budget),
            BudgetStrategy::Fair => fair(&ranked, budget),
            BudgetStrategy::Adaptive => {
                let by_rank = greedy(&ranked, budget);
                let by_density = density(&ranked, budget);
                if picked_relevance(&ranked, &by_density) > picked_relevance(&ranked, &by_rank) + 1e-12 {
                    notes.push("adaptive: relevance-density packing won".to_string());
                    by_density
                } else {
                    notes.push("adaptive: greedy packing kept".to_string());
                    by_rank
                }
            }
        };

        let mut included = Vec::new();
        let mut excluded = Vec::new();
        for (item, take) in ranked.into_iter().zip(picked) {
            if take {
                included.push(item);
            } else {
                excluded.push(item);
            }
        }
        let excluded_due_to_budget = excluded.len();
        let excluded_high_relevance: Vec<RegretEntry> = excluded
            .iter()
            .filter(|i| i.relevance >= self.regret_threshold)
            .map(|i| RegretEntry {
                id: i.id.clone(),
                relevance: i.relevance,
                token_count: i.token_count,
            })
            .collect();
        if !filtered.is_empty() {
            notes.push(format!("{} below relevance floor", filtered.len()));
        }
        let filtered_below_threshold = filtered.len();
        excluded.extend(filtered);

        let tokens_used: usize = included.iter().map(|i| i.token_count).sum();
        let relevance: f64 = included.iter().map(|i| i.relevance).sum();
        let efficiency = if tokens_used > 0 {
            relevance / tokens_used as f64
        } else {
            0.0
        };
        debug!(
            strategy = %self.strategy,
            considered,
            included = included.len(),
            tokens_used,
            budget,
            "Budget allocated"
        );
        Ok(BudgetResult {
            audit_trail: BudgetAudit {
                strategy: self.strategy,
                candidates_considered: considered,
                filtered_below_threshold,
                included_count: included.len(),
                excluded_count: excluded.len(),
                tokens_used,
                budget_limit: budget,
                utilization: tokens_used as f64 / budget as f64,
                remaining: budget - tokens_used,
                excluded_high_relevance,
                excluded_due_to_budget,
                notes,
            },
            included,
            excluded,
            total_tokens_used: tokens_used,
            efficiency,
        })
    }
}

fn picked_relevance(ranked: &[BudgetItem], picked: &[bool]) -> f64 {
    ranked
        .iter()
        .zip(picked)
        .filter(|(_, take)| **take)
        .map(|(i, _)| i.relevance)
        .sum()
}

fn greedy(ranked: &[BudgetItem], budget: usize) -> Vec<bool> {
    let mut used = 0;
    ranked
        .iter()
        .map(|item| {
            let fits = used + item.token_count <= budget;
            if fits {
                used += item.token_count;
            }
            fits
        })
        .collect()
}

fn density(ranked: &[BudgetItem], budget: usize) -> Vec<bool> {
    let score = |i: &BudgetItem| {
        if i.token_count == 0 {
            f64::INFINITY
        } else {
            i.relevance / i.token_count as f64
        }
    };
    let mut order: Vec<usize> = (0..ranked.len()).collect();
    order.sort_by(|&a, &b| score(&ranked[b]).total_cmp(&score(&ranked[a])).then(a.cmp(&b)));
    let mut picked = vec![false; ranked.len()];
    let mut used = 0;
    for idx in order {
        if used + ranked[idx].token_count <= budget {
            used += ranked[idx].token_count;
            picked[idx] = true;
        }
    }
    picked
}

/// Equal share per participant, best participant first, then a greedy top-up.
fn fair(ranked: &[BudgetItem], budget: usize) -> Vec<bool> {
    let mut participants: Vec<&str> = Vec::new();
    for item in ranked {
        if !participants.contains(&item.participant()) {
            participants.push(item.participant());
        }
    }
    let mut picked = vec![false; ranked.len()];
    let mut remaining = budget;
    for (served, participant) in participants.iter().enumerate() {
        let share = remaining / (participants.len() - served);
        let mut spent = 0;
        for (idx, item) in ranked.iter().enumerate() {
            if item.participant() == *participant && spent + item.token_count <= share {
                spent += item.token_count;
                picked[idx] = true;
            }
        }
        remaining -= spent;
    }
    for (idx, item) in ranked.iter().enumerate() {
        if !picked[idx] && item.token_count <= remaining {
            remaining -= item.token_count;
            picked[idx] = true;
        }
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str, relevance: f64, tokens: usize, doc: &str) -> BudgetItem {
        BudgetItem::new(id, id, relevance, doc, IndexLevel::Paragraph)
            .with_tokens(tokens)
            .with_metadata("doc_id", json!(doc))
    }

    #[test]
    fn test_zero_budget_rejected() {
        let err = TokenBudgetManager::default()
            .allocate(vec![item("a", 0.5, 1, "d")], 0, None)
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn test_greedy_skips_oversize_and_reports_regret() {
        let items = vec![
            item("big", 0.95, 80, "d"),
            item("a", 0.9, 30, "d"),
            item("b", 0.5, 30, "d"),
            item("c", 0.2, 30, "d"),
        ];
        let result = TokenBudgetManager::default().allocate(items, 70, None).unwrap();
        let ids: Vec<&str> = result.included.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(result.total_tokens_used, 60);
        assert_eq!(result.audit_trail.excluded_high_relevance.len(), 1);
        assert_eq!(result.audit_trail.excluded_high_relevance[0].id, "big");
        assert_eq!(result.audit_trail.remaining, 10);
    }

    #[test]
    fn test_min_relevance_filters_first() {
        let items = vec![item("a", 0.9, 10, "d"), item("b", 0.1, 10, "d")];
        let result = TokenBudgetManager::default()
            .allocate(items, 100, Some(0.3))
            .unwrap();
        assert_eq!(result.included.len(), 1);
        assert_eq!(result.audit_trail.filtered_below_threshold, 1);
        assert_eq!(result.excluded.len(), 1);
        assert_eq!(result.audit_trail.excluded_due_to_budget, 0);
    }

    #[test]
    fn test_fair_shares_across_documents() {
        let items = vec![
            item("a1", 0.9, 40, "a"),
            item("a2", 0.85, 40, "a"),
            item("a3", 0.8, 40, "a"),
            item("b1", 0.3, 40, "b"),
        ];
        let greedy = TokenBudgetManager::new(BudgetStrategy::Greedy)
            .allocate(items.clone(), 100, None)
            .unwrap();
        assert!(greedy.included.iter().all(|i| i.participant() == "a"));

        let fair = TokenBudgetManager::new(BudgetStrategy::Fair)
            .allocate(items, 100, None)
            .unwrap();
        assert!(fair.included.iter().any(|i| i.id == "b1"));
        assert!(fair.total_tokens_used <= 100);
    }

    #[test]
    fn test_adaptive_prefers_density_when_better() {
        let items = vec![
            item("wide", 0.9, 100, "d"),
            item("s1", 0.8, 50, "d"),
            item("s2", 0.8, 50, "d"),
        ];
        let result = TokenBudgetManager::new(BudgetStrategy::Adaptive)
            .allocate(items, 100, None)
            .unwrap();
        let ids: Vec<&str> = result.included.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
        assert!(result.audit_trail.notes[0].contains("density"));
    }
}
