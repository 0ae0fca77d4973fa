//! Post-budget compression of selected items.

use crate::budget::BudgetItem;
use crate::dedup::recency_value;
use crate::text::{count_tokens, split_sentences};
use aimos_types::config::CompressionConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

/// How much of an item survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompressionLevel {
    Full,
    Detailed,
    Brief,
    Reference,
}

impl CompressionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::Detailed => "DETAILED",
            Self::Brief => "BRIEF",
            Self::Reference => "REFERENCE",
        }
    }
}

/// Totals for one compression run.
#[derive(Debug, Clone, Serialize)]
pub struct CompressionOutcome {
    pub items: Vec<BudgetItem>,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub tokens_saved: usize,
    /// tokens_after / tokens_before, 1.0 when nothing was there.
    pub ratio: f64,
    pub compressed_items: usize,
}

/// Reduces item token counts without reordering.
pub trait Compressor: Send + Sync {
    fn name(&self) -> &str;

    fn compress(&self, items: Vec<BudgetItem>, now: DateTime<Utc>) -> CompressionOutcome;
}

/// Compresses harder the older an item is.
#[derive(Debug, Clone, Default)]
pub struct AgeCompressor {
    config: CompressionConfig,
}

impl AgeCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Level for an item of `age_days` with the given priority.
    pub fn level_for(&self, age_days: f64, priority: f64) -> CompressionLevel {
        let c = &self.config;
        let (full, detailed, brief) = if priority >= c.high_priority_threshold {
            (c.full_max_days * 3.0, c.detailed_max_days * 2.5, c.brief_max_days * 2.0)
        } else {
            (c.full_max_days, c.detailed_max_days, c.brief_max_days)
        };
        if age_days < full {
            CompressionLevel::Full
        } else if age_days < detailed {
            CompressionLevel::Detailed
        } else if age_days < brief {
            CompressionLevel::Brief
        } else {
            CompressionLevel::Reference
        }
    }

    fn ratio(&self, level: CompressionLevel) -> f64 {
        match level {
            CompressionLevel::Full => 1.0,
            CompressionLevel::Detailed => self.config.detailed_ratio,
            CompressionLevel::Brief => self.config.brief_ratio,
            CompressionLevel::Reference => self.config.reference_ratio,
        }
    }

    /// Key-sentence rendering of `text` at `level`, cut to `target` tokens.
    pub fn compress_text(&self, text: &str, level: CompressionLevel, target: usize) -> String {
        let sentences = split_sentences(text);
        let n = sentences.len();
        let keyed = match (level, n) {
            (CompressionLevel::Full, _) | (_, 0) => return text.to_string(),
            (CompressionLevel::Detailed, n) if n <= 3 => text.to_string(),
            (CompressionLevel::Detailed, n) => {
                format!("{} {} {}", sentences[0], sentences[n / 2], sentences[n - 1])
            }
            (CompressionLevel::Brief, 1) => sentences[0].clone(),
            (CompressionLevel::Brief, n) => format!("{} ... {}", sentences[0], sentences[n - 1]),
            (CompressionLevel::Reference, n) => {
                format!("{} [{n} sentences, compressed to reference]", sentences[0])
            }
        };
        cut_to_tokens(&keyed, target)
    }
}

fn cut_to_tokens(text: &str, target: usize) -> String {
    if count_tokens(text) <= target {
        return text.to_string();
    }
    let mut kept: Vec<&str> = Vec::new();
    let mut used = 0;
    for word in text.split_whitespace() {
        let cost = count_tokens(word);
        if used + cost > target {
            break;
        }
        used += cost;
        kept.push(word);
    }
    kept.join(" ")
}

fn age_days(item: &BudgetItem, now: DateTime<Utc>) -> f64 {
    recency_value(item)
        .map(|secs| ((now.timestamp_micros() as f64 / 1e6 - secs) / 86_400.0).max(0.0))
        .unwrap_or(0.0)
}

fn priority(item: &BudgetItem) -> f64 {
    item.metadata
        .get("priority")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0)
}

impl Compressor for AgeCompressor {
    fn name(&self) -> &str {
        "age"
    }

    fn compress(&self, items: Vec<BudgetItem>, now: DateTime<Utc>) -> CompressionOutcome {
        let tokens_before: usize = items.iter().map(|i| i.token_count).sum();
        let mut compressed_items = 0;
        let items: Vec<BudgetItem> = items
            .into_iter()
            .map(|mut item| {
                let level = self.level_for(age_days(&item, now), priority(&item));
                if level == CompressionLevel::Full {
                    return item;
                }
                let target = ((item.token_count as f64 * self.ratio(level)).ceil() as usize)
                    .max(self.config.min_compressed_tokens);
                let content = self.compress_text(&item.content, level, target);
                let tokens = count_tokens(&content);
                if tokens >= item.token_count {
                    return item;
                }
                item.metadata.insert("compression_level".into(), json!(level.as_str()));
                item.metadata.insert("original_tokens".into(), json!(item.token_count));
                item.content = content;
                item.token_count = tokens;
                compressed_items += 1;
                item
            })
            .collect();
        let tokens_after: usize = items.iter().map(|i| i.token_count).sum();
        CompressionOutcome {
            items,
            tokens_before,
            tokens_after,
            tokens_saved: tokens_before - tokens_after,
            ratio: if tokens_before > 0 {
                tokens_after as f64 / tokens_before as f64
            } else {
                1.0
            },
            compressed_items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aimos_types::index::IndexLevel;
    use chrono::Duration;

    const TEXT: &str = "First point about atoms. Second point about hashing. \
        Third point about snapshots. Fourth point about journals. Fifth point about replay.";

    fn aged(id: &str, days: i64, now: DateTime<Utc>) -> BudgetItem {
        BudgetItem::new(id, TEXT, 0.5, "src", IndexLevel::Paragraph)
            .with_metadata("timestamp", json!((now - Duration::days(days)).to_rfc3339()))
    }

    #[test]
    fn test_levels_by_age_and_priority() {
        let c = AgeCompressor::default();
        assert_eq!(c.level_for(1.0, 0.0), CompressionLevel::Full);
        assert_eq!(c.level_for(10.0, 0.0), CompressionLevel::Detailed);
        assert_eq!(c.level_for(45.0, 0.0), CompressionLevel::Brief);
        assert_eq!(c.level_for(120.0, 0.0), CompressionLevel::Reference);
        assert_eq!(c.level_for(20.0, 0.9), CompressionLevel::Full);
        assert_eq!(c.level_for(170.0, 0.9), CompressionLevel::Brief);
    }

    #[test]
    fn test_compression_never_grows_and_keeps_order() {
        let now = Utc::now();
        let items = vec![aged("new", 1, now), aged("mid", 40, now), aged("old", 365, now)];
        let before: Vec<usize> = items.iter().map(|i| i.token_count).collect();
        let outcome = AgeCompressor::default().compress(items, now);
        let ids: Vec<&str> = outcome.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
        for (item, was) in outcome.items.iter().zip(before) {
            assert!(item.token_count <= was);
        }
        assert_eq!(outcome.items[0].content, TEXT);
        assert!(outcome.items[1].content.contains(" ... "));
        assert!(outcome.items[2].content.starts_with("First point"));
        assert!(outcome.tokens_saved > 0);
        assert!(outcome.ratio < 1.0);
        assert_eq!(outcome.compressed_items, 2);
    }

    #[test]
    fn test_undated_items_untouched() {
        let item = BudgetItem::new("x", TEXT, 0.5, "src", IndexLevel::Paragraph);
        let outcome = AgeCompressor::default().compress(vec![item.clone()], Utc::now());
        assert_eq!(outcome.items[0], item);
        assert_eq!(outcome.ratio, 1.0);
    }
}
