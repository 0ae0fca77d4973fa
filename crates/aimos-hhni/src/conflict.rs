//! Stance conflict resolution.
//!
//! Candidates sharing a topic but holding opposite stances are collapsed to a
//! single representative. Conflicts are recorded, never raised.

use crate::budget::BudgetItem;
use crate::dedup::{authority_value, best_index, recency_value, weighted_scores};
use aimos_types::config::ConflictConfig;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::info;

const TOPIC_KEYS: [&str; 4] = ["topic", "claim_id", "entity", "subject"];
const STANCE_KEYS: [&str; 3] = ["stance", "polarity", "label"];
const POSITIVE: [&str; 5] = ["positive", "supports", "pro", "affirmative", "for"];
const NEGATIVE: [&str; 5] = ["negative", "contra", "against", "refutes", "con"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stance {
    Positive,
    Negative,
}

fn first_str<'a>(metadata: &'a BTreeMap<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| metadata.get(*k).and_then(|v| v.as_str()))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Lowercased topic key.
pub fn topic_of(metadata: &BTreeMap<String, Value>) -> Option<String> {
    first_str(metadata, &TOPIC_KEYS).map(str::to_lowercase)
}

/// Polarity of the stance label, if it is a known one.
pub fn stance_of(metadata: &BTreeMap<String, Value>) -> Option<Stance> {
    let label = first_str(metadata, &STANCE_KEYS)?.to_lowercase();
    if POSITIVE.contains(&label.as_str()) {
        Some(Stance::Positive)
    } else if NEGATIVE.contains(&label.as_str()) {
        Some(Stance::Negative)
    } else {
        None
    }
}

fn stance_label(item: &BudgetItem) -> String {
    first_str(&item.metadata, &STANCE_KEYS)
        .map(str::to_lowercase)
        .unwrap_or_default()
}

/// One resolved topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictRecord {
    pub topic: String,
    /// Distinct stance labels seen on the topic.
    pub stances: Vec<String>,
    pub winning_stance: String,
    pub representative_id: String,
    pub suppressed_ids: Vec<String>,
    pub rationale: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConflictMetrics {
    pub total_candidates: usize,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    pub suppressed_items: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictResult {
    pub items: Vec<BudgetItem>,
    pub records: Vec<ConflictRecord>,
    pub metrics: ConflictMetrics,
}

#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    config: ConflictConfig,
}

impl ConflictResolver {
    pub fn new(config: ConflictConfig) -> Self {
        Self { config }
    }

    /// Keep one item per conflicting topic; everything else passes through.
    pub fn resolve(&self, items: Vec<BudgetItem>) -> ConflictResult {
        let total = items.len();
        let mut topics: Vec<(String, Vec<usize>)> = Vec::new();
        for (idx, item) in items.iter().enumerate() {
            if stance_of(&item.metadata).is_none() {
                continue;
            }
            let Some(topic) = topic_of(&item.metadata) else {
                continue;
            };
            match topics.iter_mut().find(|(t, _)| *t == topic) {
                Some((_, members)) => members.push(idx),
                None => topics.push((topic, vec![idx])),
            }
        }

        let mut suppressed: HashSet<usize> = HashSet::new();
        let mut records = Vec::new();
        for (topic, members) in &topics {
            let polarities: HashSet<Option<Stance>> =
                members.iter().map(|&m| stance_of(&items[m].metadata)).collect();
            if polarities.len() < 2 {
                continue;
            }
            let group: Vec<&BudgetItem> = members.iter().map(|&m| &items[m]).collect();
            let scores = weighted_scores(&group, self.config.recency_bias, self.config.authority_bias);
            let best = best_index(&scores);
            let winner = &items[members[best]];

            let mut losers: Vec<String> = Vec::new();
            for &m in members.iter().filter(|&&m| m != members[best]) {
                suppressed.insert(m);
                losers.push(items[m].id.clone());
            }
            losers.sort();
            let stances: BTreeSet<String> = group.iter().map(|i| stance_label(i)).collect();
            let rationale = format!(
                "'{}' scored {:.3} (relevance {:.2}, authority {:.2}{}) against {} opposing item(s)",
                winner.id,
                scores[best],
                winner.relevance,
                authority_value(winner),
                recency_value(winner)
                    .map(|_| ", dated")
                    .unwrap_or(", undated"),
                losers.len()
            );
            info!(
                topic = %topic,
                representative_id = %winner.id,
                suppressed = losers.len(),
                "Resolved stance conflict"
            );
            records.push(ConflictRecord {
                topic: topic.clone(),
                stances: stances.into_iter().collect(),
                winning_stance: stance_label(winner),
                representative_id: winner.id.clone(),
                suppressed_ids: losers,
                rationale,
            });
        }

        let metrics = ConflictMetrics {
            total_candidates: total,
            conflicts_detected: records.len(),
            conflicts_resolved: records.len(),
            suppressed_items: suppressed.len(),
        };
        let items = items
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| !suppressed.contains(idx))
            .map(|(_, item)| item)
            .collect();
        ConflictResult {
            items,
            records,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aimos_types::index::IndexLevel;
    use serde_json::json;

    fn claim(id: &str, stance: &str, confidence: f64, timestamp: &str) -> BudgetItem {
        BudgetItem::new(id, format!("claim {id}"), 0.7, "src", IndexLevel::Paragraph)
            .with_metadata("topic", json!("Beta Stability"))
            .with_metadata("stance", json!(stance))
            .with_metadata("confidence", json!(confidence))
            .with_metadata("timestamp", json!(timestamp))
    }

    #[test]
    fn test_stance_parsing() {
        let meta = BTreeMap::from([("polarity".to_string(), json!("Refutes"))]);
        assert_eq!(stance_of(&meta), Some(Stance::Negative));
        let meta = BTreeMap::from([("stance".to_string(), json!("neutral"))]);
        assert_eq!(stance_of(&meta), None);
        let meta = BTreeMap::from([("claim_id".to_string(), json!(" C-7 "))]);
        assert_eq!(topic_of(&meta).as_deref(), Some("c-7"));
    }

    #[test]
    fn test_authority_decides() {
        let items = vec![
            claim("weak", "supports", 0.2, "2025-01-01T00:00:00Z"),
            claim("strong", "refutes", 0.9, "2025-01-01T00:00:00Z"),
        ];
        let result = ConflictResolver::default().resolve(items);
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].id, "strong");
        let record = &result.records[0];
        assert_eq!(record.topic, "beta stability");
        assert_eq!(record.winning_stance, "refutes");
        assert_eq!(record.suppressed_ids, vec!["weak".to_string()]);
        assert_eq!(record.stances, vec!["refutes".to_string(), "supports".to_string()]);
        assert_eq!(result.metrics.suppressed_items, 1);
    }

    #[test]
    fn test_same_stance_passes_through() {
        let items = vec![
            claim("a", "supports", 0.5, "2025-01-01T00:00:00Z"),
            claim("b", "pro", 0.5, "2025-01-02T00:00:00Z"),
            BudgetItem::new("plain", "no metadata", 0.4, "src", IndexLevel::Paragraph),
        ];
        let result = ConflictResolver::default().resolve(items.clone());
        assert_eq!(result.items, items);
        assert_eq!(result.metrics.conflicts_detected, 0);
    }

    #[test]
    fn test_full_tie_keeps_earlier() {
        let items = vec![
            claim("first", "supports", 0.5, "2025-01-01T00:00:00Z"),
            claim("second", "refutes", 0.5, "2025-01-01T00:00:00Z"),
        ];
        let result = ConflictResolver::default().resolve(items);
        assert_eq!(result.records[0].representative_id, "first");
    }
}
