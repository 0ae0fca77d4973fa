//! Ingestion and query safety gates for the hierarchical index.

use aimos_types::atom::AtomContent;
use aimos_types::config::HhniConfig;
use aimos_types::{AimosError, AimosResult};
use std::time::Duration;

/// Marker of a graph-style node query that accepts a `first:` argument.
const GRAPH_QUERY_MARKER: &str = "queryHHNINode(";

/// Limits enforced before any node is built.
#[derive(Debug, Clone)]
pub struct SafetyGates {
    pub max_atom_size: usize,
    pub max_paragraph_length: usize,
    pub max_sentence_length: usize,
    pub max_nodes_per_atom: usize,
    pub max_embedding_batch: usize,
    pub indexing_timeout: Duration,
}

impl Default for SafetyGates {
    fn default() -> Self {
        Self::from_config(&HhniConfig::default())
    }
}

impl SafetyGates {
    pub fn from_config(config: &HhniConfig) -> Self {
        Self {
            max_atom_size: config.max_atom_size,
            max_paragraph_length: config.max_paragraph_length,
            max_sentence_length: config.max_sentence_length,
            max_nodes_per_atom: config.max_nodes_per_atom,
            max_embedding_batch: config.max_embedding_batch.max(1),
            indexing_timeout: Duration::from_secs(config.indexing_timeout_secs.max(1)),
        }
    }

    /// The build path only accepts inline payloads.
    pub fn check_content(&self, content: &AtomContent) -> AimosResult<()> {
        if content.is_uri_only() {
            return Err(AimosError::validation(
                "URI-only content cannot be indexed; fetch the payload first",
            ));
        }
        match &content.inline {
            Some(text) => self.check_document(text),
            None => Err(AimosError::validation("content has no inline payload")),
        }
    }

    /// Size checks on the whole document.
    pub fn check_document(&self, text: &str) -> AimosResult<()> {
        if text.trim().is_empty() {
            return Err(AimosError::validation("document is empty"));
        }
        if text.len() > self.max_atom_size {
            return Err(AimosError::Validation(format!(
                "document too large: {} bytes (max {})",
                text.len(),
                self.max_atom_size
            )));
        }
        Ok(())
    }

    pub fn check_paragraph(&self, paragraph: &str) -> AimosResult<()> {
        let len = paragraph.chars().count();
        if len > self.max_paragraph_length {
            return Err(AimosError::Validation(format!(
                "paragraph too long: {len} chars (max {})",
                self.max_paragraph_length
            )));
        }
        Ok(())
    }

    pub fn check_sentence(&self, sentence: &str) -> AimosResult<()> {
        let len = sentence.chars().count();
        if len > self.max_sentence_length {
            return Err(AimosError::Validation(format!(
                "sentence too long: {len} chars (max {})",
                self.max_sentence_length
            )));
        }
        Ok(())
    }

    pub fn check_node_count(&self, count: usize) -> AimosResult<()> {
        if count > self.max_nodes_per_atom {
            return Err(AimosError::Validation(format!(
                "document would produce {count} index nodes (max {})",
                self.max_nodes_per_atom
            )));
        }
        Ok(())
    }
}

/// Limits enforced on reads.
#[derive(Debug, Clone)]
pub struct QueryGates {
    pub max_traversal_depth: usize,
    pub default_first: usize,
    pub max_results: usize,
}

impl Default for QueryGates {
    fn default() -> Self {
        Self::from_config(&HhniConfig::default())
    }
}

impl QueryGates {
    pub fn from_config(config: &HhniConfig) -> Self {
        Self {
            max_traversal_depth: config.max_traversal_depth,
            default_first: config.default_first,
            max_results: config.max_results,
        }
    }

    pub fn check_depth(&self, depth: usize) -> AimosResult<()> {
        if depth > self.max_traversal_depth {
            return Err(AimosError::Validation(format!(
                "traversal depth {depth} exceeds limit {}",
                self.max_traversal_depth
            )));
        }
        Ok(())
    }

    /// Clamp a requested result count.
    pub fn clamp_results(&self, requested: usize) -> usize {
        requested.min(self.max_results)
    }

    /// Inject `first: N` into a node query that has no explicit limit.
    pub fn apply_limits(&self, query: &str, first: Option<usize>) -> String {
        if !query.contains(GRAPH_QUERY_MARKER) || query.contains("first:") {
            return query.to_string();
        }
        let limit = self.clamp_results(first.unwrap_or(self.default_first));
        let injected = format!("{GRAPH_QUERY_MARKER}first: {limit}, ");
        query.replacen(GRAPH_QUERY_MARKER, &injected, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_only_rejected() {
        let gates = SafetyGates::default();
        let err = gates
            .check_content(&AtomContent::uri("s3://bucket/doc", "text/plain"))
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(gates.check_content(&AtomContent::inline("hello")).is_ok());
    }

    #[test]
    fn test_oversize_document_rejected() {
        let gates = SafetyGates {
            max_atom_size: 10,
            ..SafetyGates::default()
        };
        assert!(gates.check_document("short").is_ok());
        assert!(gates.check_document("this is far too long").is_err());
        assert!(gates.check_document("   ").is_err());
    }

    #[test]
    fn test_apply_limits_injects_first() {
        let gates = QueryGates::default();
        let q = "{ queryHHNINode(level: PARAGRAPH) { id } }";
        assert_eq!(
            gates.apply_limits(q, None),
            "{ queryHHNINode(first: 1000, level: PARAGRAPH) { id } }"
        );
        let explicit = "{ queryHHNINode(first: 5) { id } }";
        assert_eq!(gates.apply_limits(explicit, Some(50)), explicit);
        assert_eq!(gates.apply_limits("{ other }", None), "{ other }");
        assert!(gates.apply_limits(q, Some(5_000)).contains("first: 1000"));
    }

    #[test]
    fn test_depth_gate() {
        let gates = QueryGates::default();
        assert!(gates.check_depth(5).is_ok());
        assert!(gates.check_depth(6).is_err());
    }
}
