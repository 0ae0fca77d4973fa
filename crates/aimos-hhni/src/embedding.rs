//! Embedding providers for the hierarchical index.
//!
//! Provides an `EmbeddingProvider` trait, a deterministic hashing provider
//! used as the offline fallback, and an OpenAI-compatible HTTP provider for
//! any service offering a `/v1/embeddings` endpoint.

use crate::text::word_tokens;
use aimos_types::config::EmbeddingConfig;
use aimos_types::AimosError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Name the fallback provider is registered under.
pub const FALLBACK_PROVIDER: &str = "fallback";

/// Error type for embedding operations.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing API key: {0}")]
    MissingApiKey(String),
    #[error("Embedding call timed out after {0:?}")]
    Timeout(Duration),
}

impl From<EmbeddingError> for AimosError {
    fn from(e: EmbeddingError) -> Self {
        match e {
            EmbeddingError::Api { status: 429, message } => AimosError::RateLimit(message),
            EmbeddingError::Api {
                status: 401 | 403,
                message,
            } => AimosError::Auth(message),
            EmbeddingError::MissingApiKey(msg) => AimosError::Auth(msg),
            EmbeddingError::Timeout(d) => {
                AimosError::Timeout(format!("embedding call exceeded {d:?}"))
            }
            other => AimosError::Internal(other.to_string()),
        }
    }
}

/// Trait for computing text embeddings.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Registry name of this provider.
    fn name(&self) -> &str;

    /// Compute embedding vectors for a batch of texts.
    async fn encode(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Compute embedding for a single text.
    async fn encode_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let results = self.encode(&[text]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Parse("Empty embedding response".to_string()))
    }

    /// Return the dimensionality of embeddings produced by this provider.
    fn dimensions(&self) -> usize;
}

/// Deterministic bag-of-words embedding.
///
/// Each lowercase word is hashed (FNV-1a) into one of `dims` buckets and the
/// counts are L2-normalised. Texts sharing words get positive cosine
/// similarity; empty text maps to the zero vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    /// Synchronous embedding of one text.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for word in word_tokens(text) {
            let bucket = (fnv1a(word.as_bytes()) % self.dims as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

/// 64-bit FNV-1a. Buckets must not change between processes or toolchain
/// releases, or embeddings stored by one run stop matching queries from the
/// next; `DefaultHasher` is seeded per process and unspecified across
/// releases.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn name(&self) -> &str {
        FALLBACK_PROVIDER
    }

    async fn encode(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// OpenAI-compatible embedding provider.
pub struct OpenAiEmbeddingProvider {
    name: String,
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
    dims: usize,
    timeout: Duration,
}

#[derive(Serialize)]
struct EncodeRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EncodeResponse {
    data: Vec<EncodeData>,
}

#[derive(Deserialize)]
struct EncodeData {
    embedding: Vec<f32>,
}

impl OpenAiEmbeddingProvider {
    /// Build from config; the API key is read from `config.api_key_env`.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let api_key = std::env::var(&config.api_key_env).unwrap_or_default();
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let is_local = base_url.contains("localhost") || base_url.contains("127.0.0.1");
        if api_key.is_empty() && !is_local {
            return Err(EmbeddingError::MissingApiKey(config.api_key_env.clone()));
        }
        if !is_local {
            warn!(
                provider = %config.provider,
                base_url = %base_url,
                "Embedding provider sends document text to an external API"
            );
        }
        let timeout = Duration::from_millis(config.timeout_ms.max(1));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbeddingError::Http(e.to_string()))?;
        Ok(Self {
            name: config.provider.clone(),
            api_key,
            base_url,
            model: config.model.clone(),
            client,
            dims: infer_dimensions(&config.model),
            timeout,
        })
    }
}

/// Infer embedding dimensions from model name.
fn infer_dimensions(model: &str) -> usize {
    match model {
        "text-embedding-3-large" => 3072,
        "all-MiniLM-L6-v2" | "all-MiniLM-L12-v2" => 384,
        "all-mpnet-base-v2" | "nomic-embed-text" => 768,
        "mxbai-embed-large" => 1024,
        _ => 1536,
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn encode(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let url = format!("{}/embeddings", self.base_url);
        let body = EncodeRequest {
            model: &self.model,
            input: texts,
        };
        let mut req = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                EmbeddingError::Timeout(self.timeout)
            } else {
                EmbeddingError::Http(e.to_string())
            }
        })?;
        let status = resp.status().as_u16();
        if status != 200 {
            let message = resp.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api { status, message });
        }
        let data: EncodeResponse = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::Parse(e.to_string()))?;
        let vectors: Vec<Vec<f32>> = data.data.into_iter().map(|d| d.embedding).collect();
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::Parse(format!(
                "expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        debug!(count = vectors.len(), dims = self.dims, "Embedded batch");
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Name → provider mapping, fixed at construction.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn EmbeddingProvider>>,
    default: String,
}

impl ProviderRegistry {
    /// A registry holding only `provider`, which becomes the default.
    pub fn single(provider: Arc<dyn EmbeddingProvider>) -> Self {
        let default = provider.name().to_string();
        let mut providers = HashMap::new();
        providers.insert(default.clone(), provider);
        Self { providers, default }
    }

    /// Fallback provider always present; the configured one becomes the
    /// default when it can be built.
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        let mut registry = Self::single(Arc::new(HashingEmbedder::new(config.dimensions)));
        if config.provider != FALLBACK_PROVIDER {
            match OpenAiEmbeddingProvider::from_config(config) {
                Ok(provider) => {
                    registry.default = config.provider.clone();
                    registry
                        .providers
                        .insert(config.provider.clone(), Arc::new(provider));
                }
                Err(e) => warn!(
                    provider = %config.provider,
                    error = %e,
                    "Embedding provider unavailable, using fallback"
                ),
            }
        }
        registry
    }

    /// Add a provider under its own name.
    pub fn register(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    /// Look up by name, or the default when `name` is `None`.
    pub fn get(&self, name: Option<&str>) -> Option<Arc<dyn EmbeddingProvider>> {
        self.providers.get(name.unwrap_or(&self.default)).cloned()
    }

    pub fn default_provider(&self) -> Arc<dyn EmbeddingProvider> {
        self.providers
            .get(&self.default)
            .cloned()
            .unwrap_or_else(|| Arc::new(HashingEmbedder::default()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1.0, 1.0]; mismatched or empty inputs give 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashing_embedder_is_deterministic() {
        let e = HashingEmbedder::new(64);
        assert_eq!(e.embed_text("critical information"), e.embed_text("Critical INFORMATION"));
        assert!(e.embed_text("").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_buckets_are_fixed_across_runs() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
        let vector = HashingEmbedder::default().embed_text("A");
        assert_eq!(vector[0x8c], 1.0);
        assert_eq!(vector.iter().filter(|v| **v != 0.0).count(), 1);
    }

    #[test]
    fn test_hashing_embedder_similarity_tracks_overlap() {
        let e = HashingEmbedder::default();
        let q = e.embed_text("critical information");
        let hit = e.embed_text("the critical information is here");
        let miss = e.embed_text("unrelated words entirely");
        assert!(cosine_similarity(&q, &hit) > cosine_similarity(&q, &miss));
        assert!((cosine_similarity(&q, &q) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_similarity_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_error_mapping() {
        let rate: AimosError = EmbeddingError::Api {
            status: 429,
            message: "slow down".into(),
        }
        .into();
        assert_eq!(rate.kind(), "rate_limit");
        let auth: AimosError = EmbeddingError::Api {
            status: 401,
            message: "bad key".into(),
        }
        .into();
        assert_eq!(auth.kind(), "auth");
        let timeout: AimosError = EmbeddingError::Timeout(Duration::from_secs(1)).into();
        assert_eq!(timeout.kind(), "timeout");
    }

    #[test]
    fn test_registry_falls_back_without_api_key() {
        let config = EmbeddingConfig {
            provider: "openai".into(),
            api_key_env: "AIMOS_TEST_MISSING_KEY_VAR".into(),
            ..Default::default()
        };
        let registry = ProviderRegistry::from_config(&config);
        assert_eq!(registry.default_provider().name(), FALLBACK_PROVIDER);
        assert!(registry.get(Some("openai")).is_none());
    }

    #[tokio::test]
    async fn test_encode_batch() {
        let e = HashingEmbedder::new(32);
        let out = e.encode(&["a b", "c"]).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 32);
    }
}
