//! Configuration types for the memory core.
//!
//! Every section derives `Default` and is `#[serde(default)]`, so a config
//! file only needs the keys it wants to override.

use crate::error::{AimosError, AimosResult};
use crate::index::IndexLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Environment variable selecting the repository backend.
pub const BACKEND_ENV: &str = "CMC_BACKEND";
/// Environment variable overriding the store directory.
pub const STORE_DIR_ENV: &str = "AIMOS_STORE_DIR";

/// Repository backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Embedded relational store with WAL durability.
    #[default]
    Sqlite,
    /// Append-only journal files, one per stream.
    Jsonl,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Jsonl => "jsonl",
        }
    }

    /// Read the backend selector from the environment, if set.
    pub fn from_env() -> AimosResult<Option<Self>> {
        match std::env::var(BACKEND_ENV) {
            Ok(raw) if !raw.trim().is_empty() => raw.parse().map(Some),
            _ => Ok(None),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = AimosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "jsonl" | "journal" => Ok(Self::Jsonl),
            other => Err(AimosError::Config(format!(
                "unsupported backend '{other}' (expected sqlite or jsonl)"
            ))),
        }
    }
}

/// Token allocation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BudgetStrategy {
    /// Highest relevance first while budget permits.
    #[default]
    Greedy,
    /// Equal share across participants.
    Fair,
    /// Best of greedy and relevance-density packing.
    Adaptive,
}

impl fmt::Display for BudgetStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Greedy => "GREEDY",
            Self::Fair => "FAIR",
            Self::Adaptive => "ADAPTIVE",
        })
    }
}

impl FromStr for BudgetStrategy {
    type Err = AimosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GREEDY" => Ok(Self::Greedy),
            "FAIR" => Ok(Self::Fair),
            "ADAPTIVE" => Ok(Self::Adaptive),
            other => Err(AimosError::Config(format!("unknown budget strategy '{other}'"))),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AimosConfig {
    pub store: StoreConfig,
    pub hhni: HhniConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub pool: PoolConfig,
}

/// `[store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    /// Directory holding the database or journal files.
    pub dir: PathBuf,
    /// How long sqlite waits on a locked database.
    pub busy_timeout_ms: u64,
    /// Inline payloads above this many bytes are offloaded to `payloads/`.
    pub max_inline_payload: usize,
    /// Cap on the total inline payload held by one store.
    pub max_total_payload: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Sqlite,
            dir: default_home_dir().join("cmc"),
            busy_timeout_ms: 5_000,
            max_inline_payload: 1_000_000,
            max_total_payload: 100_000_000,
        }
    }
}

impl StoreConfig {
    /// A config rooted at `dir` with the given backend.
    pub fn at(dir: impl Into<PathBuf>, backend: Backend) -> Self {
        Self {
            backend,
            dir: dir.into(),
            ..Default::default()
        }
    }
}

/// `[hhni]` section: index safety and query gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HhniConfig {
    /// Largest document (bytes) accepted by the build path.
    pub max_atom_size: usize,
    pub max_paragraph_length: usize,
    pub max_sentence_length: usize,
    /// Cap on nodes produced for one document, tokens included.
    pub max_nodes_per_atom: usize,
    /// Texts per embedding call.
    pub max_embedding_batch: usize,
    /// Budget for the embedding phase of one build.
    pub indexing_timeout_secs: u64,
    pub max_traversal_depth: usize,
    /// `first` injected into graph queries without an explicit limit.
    pub default_first: usize,
    /// Cap on results of any single query.
    pub max_results: usize,
    /// `priority` tag weight at or above which atoms are indexed.
    pub priority_threshold: f64,
}

impl Default for HhniConfig {
    fn default() -> Self {
        Self {
            max_atom_size: 100_000,
            max_paragraph_length: 5_000,
            max_sentence_length: 500,
            max_nodes_per_atom: 5_000,
            max_embedding_batch: 100,
            indexing_timeout_secs: 30,
            max_traversal_depth: 5,
            default_first: 1_000,
            max_results: 1_000,
            priority_threshold: 0.8,
        }
    }
}

/// `[embedding]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Registered provider name (`fallback`, `openai`, ...).
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// Env var that holds the API key.
    pub api_key_env: String,
    /// Vector size of the fallback provider.
    pub dimensions: usize,
    pub timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "fallback".to_string(),
            model: "text-embedding-3-small".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            dimensions: 256,
            timeout_ms: 10_000,
        }
    }
}

/// DVNS simulation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DvnsConfig {
    pub gravity_strength: f64,
    /// Pairwise gravity only applies at or above this similarity.
    pub pairwise_similarity_threshold: f64,
    pub elastic_strength: f64,
    pub rest_length: f64,
    pub repulse_strength: f64,
    pub repulse_softening: f64,
    pub damping: f64,
    pub dt: f64,
    pub max_iterations: usize,
    /// Stop once the fastest particle is slower than this.
    pub convergence_velocity: f64,
    pub min_distance: f64,
    /// Half-width of the bounding cube.
    pub max_distance: f64,
    pub max_velocity: f64,
    /// Radius of the starting shell for a zero-similarity particle.
    pub initial_spread: f64,
    pub seed: u64,
    /// Wall-clock cap on one run.
    pub time_limit_ms: Option<u64>,
}

impl Default for DvnsConfig {
    fn default() -> Self {
        Self {
            gravity_strength: 1.0,
            pairwise_similarity_threshold: 0.7,
            elastic_strength: 0.5,
            rest_length: 1.0,
            repulse_strength: 0.3,
            repulse_softening: 0.1,
            damping: 0.6,
            dt: 0.1,
            max_iterations: 200,
            convergence_velocity: 0.01,
            min_distance: 0.05,
            max_distance: 10.0,
            max_velocity: 5.0,
            initial_spread: 5.0,
            seed: 42,
            time_limit_ms: None,
        }
    }
}

/// Near-duplicate folding parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub similarity_threshold: f64,
    pub recency_bias: f64,
    pub authority_bias: f64,
    pub max_cluster_size: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.88,
            recency_bias: 0.2,
            authority_bias: 0.2,
            max_cluster_size: 6,
        }
    }
}

/// Stance-conflict resolution parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    pub enabled: bool,
    pub recency_bias: f64,
    pub authority_bias: f64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recency_bias: 0.2,
            authority_bias: 0.3,
        }
    }
}

/// Age-based compression parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub full_max_days: f64,
    pub detailed_max_days: f64,
    pub brief_max_days: f64,
    /// Priority at which age windows stretch.
    pub high_priority_threshold: f64,
    pub detailed_ratio: f64,
    pub brief_ratio: f64,
    pub reference_ratio: f64,
    pub min_compressed_tokens: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            full_max_days: 7.0,
            detailed_max_days: 30.0,
            brief_max_days: 90.0,
            high_priority_threshold: 0.85,
            detailed_ratio: 0.7,
            brief_ratio: 0.4,
            reference_ratio: 0.15,
            min_compressed_tokens: 10,
        }
    }
}

/// `[retrieval]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Candidates pulled by the coarse stage.
    pub coarse_k: usize,
    pub level: IndexLevel,
    /// Absolute relevance floor applied before DVNS and the budget.
    pub min_relevance: f64,
    pub dvns: DvnsConfig,
    /// Distance scale of anchor proximity.
    pub anchor_scale: f64,
    /// Fraction of the best refined relevance a particle must keep.
    pub dvns_keep_ratio: f64,
    pub top_k_after_dvns: Option<usize>,
    pub token_budget: usize,
    pub strategy: BudgetStrategy,
    /// Excluded items at or above this relevance are reported as regret.
    pub regret_threshold: f64,
    pub dedup: DedupConfig,
    pub conflict: ConflictConfig,
    pub compression: CompressionConfig,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            coarse_k: 100,
            level: IndexLevel::Paragraph,
            min_relevance: 0.3,
            dvns: DvnsConfig::default(),
            anchor_scale: 1.0,
            dvns_keep_ratio: 0.5,
            top_k_after_dvns: None,
            token_budget: 4_000,
            strategy: BudgetStrategy::Greedy,
            regret_threshold: 0.75,
            dedup: DedupConfig::default(),
            conflict: ConflictConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

/// `[pool]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub total_tokens: u64,
    pub total_time_seconds: f64,
    pub strategy: BudgetStrategy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            total_tokens: 100_000,
            total_time_seconds: 300.0,
            strategy: BudgetStrategy::Fair,
        }
    }
}

/// `~/.aimos`, or `./.aimos` when no home directory is known.
pub fn default_home_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".aimos"))
        .unwrap_or_else(|| PathBuf::from(".aimos"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let raw = r#"
            [store]
            backend = "jsonl"

            [retrieval]
            min_relevance = 0.1

            [retrieval.dvns]
            max_iterations = 50
        "#;
        let config: AimosConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.store.backend, Backend::Jsonl);
        assert_eq!(config.retrieval.min_relevance, 0.1);
        assert_eq!(config.retrieval.dvns.max_iterations, 50);
        assert_eq!(config.retrieval.dvns.seed, 42);
        assert_eq!(config.hhni.priority_threshold, 0.8);
        assert_eq!(config.retrieval.strategy, BudgetStrategy::Greedy);
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("SQLite".parse::<Backend>().unwrap(), Backend::Sqlite);
        assert_eq!("jsonl".parse::<Backend>().unwrap(), Backend::Jsonl);
        assert_eq!("postgres".parse::<Backend>().unwrap_err().kind(), "config_error");
    }
}
