//! Hierarchical index: document → section → paragraph → sentence → token.
//!
//! Builds are exclusive (write lock), queries run concurrently (read lock).
//! Embeddings are computed before the write lock is taken so a slow provider
//! never blocks readers.

use crate::embedding::EmbeddingProvider;
use crate::safety::{QueryGates, SafetyGates};
use crate::text::{parse_document, summarize, tokenize, word_tokens};
use aimos_types::index::IndexLevel;
use aimos_types::{AimosError, AimosResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// Export format version.
const EXPORT_VERSION: u32 = 1;

/// One cell of the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexNode {
    pub id: String,
    pub level: IndexLevel,
    pub parent_id: Option<String>,
    /// Ordered child ids.
    pub children: Vec<String>,
    pub content: String,
    pub summary: String,
    pub embedding: Vec<f32>,
    /// Source document id.
    pub doc_id: String,
    /// Positional metadata (section_index, paragraph_index, ...).
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl IndexNode {
    fn new(
        id: String,
        level: IndexLevel,
        parent_id: Option<String>,
        content: String,
        summary: String,
        doc_id: &str,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id,
            level,
            parent_id,
            children: Vec::new(),
            content,
            summary,
            embedding: Vec::new(),
            doc_id: doc_id.to_string(),
            metadata,
        }
    }

    /// Section position, when the node sits at or below a section.
    pub fn section_index(&self) -> Option<u64> {
        self.metadata.get("section_index").and_then(|v| v.as_u64())
    }
}

/// Serializable form of an index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexExport {
    pub version: u32,
    pub provider: String,
    pub dimensions: usize,
    /// doc_id → root node id.
    #[serde(default)]
    pub roots: BTreeMap<String, String>,
    pub nodes: Vec<IndexNode>,
}

#[derive(Default)]
struct IndexState {
    nodes: BTreeMap<String, IndexNode>,
    roots: BTreeMap<String, String>,
}

impl IndexState {
    fn evict(&mut self, doc_id: &str) -> usize {
        if self.roots.remove(doc_id).is_none() {
            return 0;
        }
        let before = self.nodes.len();
        self.nodes.retain(|_, node| node.doc_id != doc_id);
        before - self.nodes.len()
    }
}

/// Multi-level index over one or more documents.
pub struct HierarchicalIndex {
    state: RwLock<IndexState>,
    provider: Arc<dyn EmbeddingProvider>,
    gates: SafetyGates,
    query_gates: QueryGates,
}

impl HierarchicalIndex {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self::with_gates(provider, SafetyGates::default(), QueryGates::default())
    }

    pub fn with_gates(
        provider: Arc<dyn EmbeddingProvider>,
        gates: SafetyGates,
        query_gates: QueryGates,
    ) -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            provider,
            gates,
            query_gates,
        }
    }

    pub fn gates(&self) -> &SafetyGates {
        &self.gates
    }

    pub fn query_gates(&self) -> &QueryGates {
        &self.query_gates
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Parse, embed, and insert a document; returns the root id.
    ///
    /// Re-indexing an existing `doc_id` replaces its nodes.
    pub async fn index_document(&self, text: &str, doc_id: &str) -> AimosResult<String> {
        if doc_id.trim().is_empty() {
            return Err(AimosError::validation("doc_id must be non-empty"));
        }
        self.gates.check_document(text)?;
        let mut nodes = self.build_skeleton(text, doc_id)?;
        self.gates.check_node_count(nodes.len())?;
        self.embed_nodes(&mut nodes).await?;

        let root_id = nodes[0].id.clone();
        let count = nodes.len();
        {
            let mut state = self.state.write();
            let evicted = state.evict(doc_id);
            if evicted > 0 {
                debug!(doc_id, evicted, "Replaced previously indexed document");
            }
            for node in nodes {
                state.nodes.insert(node.id.clone(), node);
            }
            state.roots.insert(doc_id.to_string(), root_id.clone());
        }
        info!(doc_id, root_id = %root_id, nodes = count, "Indexed document");
        Ok(root_id)
    }

    /// Build the node tree without embeddings, root first.
    fn build_skeleton(&self, text: &str, doc_id: &str) -> AimosResult<Vec<IndexNode>> {
        let sections = parse_document(text);
        let root_id = format!("doc:{doc_id}");
        let mut nodes = vec![IndexNode::new(
            root_id.clone(),
            IndexLevel::System,
            None,
            text.trim().to_string(),
            summarize(text),
            doc_id,
            BTreeMap::from([("doc_id".to_string(), json!(doc_id))]),
        )];

        for (s, section) in sections.iter().enumerate() {
            let sec_id = format!("sec:{doc_id}:{s}");
            let section_text = if section.paragraphs.is_empty() {
                section.title.clone()
            } else {
                section
                    .paragraphs
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n")
            };
            let mut sec_meta = nodes[0].metadata.clone();
            sec_meta.insert("section_index".into(), json!(s));
            sec_meta.insert("section_title".into(), json!(section.title));
            nodes[0].children.push(sec_id.clone());
            let sec_pos = nodes.len();
            nodes.push(IndexNode::new(
                sec_id.clone(),
                IndexLevel::Section,
                Some(root_id.clone()),
                section_text,
                section.title.clone(),
                doc_id,
                sec_meta.clone(),
            ));

            for (p, paragraph) in section.paragraphs.iter().enumerate() {
                self.gates.check_paragraph(&paragraph.text)?;
                let para_id = format!("para:{doc_id}:{s}:{p}");
                let mut para_meta = sec_meta.clone();
                para_meta.insert("paragraph_index".into(), json!(p));
                nodes[sec_pos].children.push(para_id.clone());
                let para_pos = nodes.len();
                nodes.push(IndexNode::new(
                    para_id.clone(),
                    IndexLevel::Paragraph,
                    Some(sec_id.clone()),
                    paragraph.text.clone(),
                    summarize(&paragraph.text),
                    doc_id,
                    para_meta.clone(),
                ));

                for (i, sentence) in paragraph.sentences.iter().enumerate() {
                    self.gates.check_sentence(sentence)?;
                    let sent_id = format!("sent:{doc_id}:{s}:{p}:{i}");
                    let mut sent_meta = para_meta.clone();
                    sent_meta.insert("sentence_index".into(), json!(i));
                    nodes[para_pos].children.push(sent_id.clone());
                    let sent_pos = nodes.len();
                    nodes.push(IndexNode::new(
                        sent_id.clone(),
                        IndexLevel::Sentence,
                        Some(para_id.clone()),
                        sentence.clone(),
                        summarize(sentence),
                        doc_id,
                        sent_meta.clone(),
                    ));

                    for (t, token) in tokenize(sentence).into_iter().enumerate() {
                        let tok_id = format!("tok:{doc_id}:{s}:{p}:{i}:{t}");
                        let mut tok_meta = sent_meta.clone();
                        tok_meta.insert("token_index".into(), json!(t));
                        nodes[sent_pos].children.push(tok_id.clone());
                        nodes.push(IndexNode::new(
                            tok_id,
                            IndexLevel::Subword,
                            Some(sent_id.clone()),
                            token.clone(),
                            token,
                            doc_id,
                            tok_meta,
                        ));
                    }
                }
            }
            // Fail fast instead of building a huge tree only to reject it.
            self.gates.check_node_count(nodes.len())?;
        }
        Ok(nodes)
    }

    /// Embed every node's content in bounded batches under the build timeout.
    async fn embed_nodes(&self, nodes: &mut [IndexNode]) -> AimosResult<()> {
        let mut unique: Vec<&str> = Vec::new();
        let mut slot_of: HashMap<&str, usize> = HashMap::new();
        let mut slots = Vec::with_capacity(nodes.len());
        for node in nodes.iter() {
            let slot = *slot_of.entry(node.content.as_str()).or_insert_with(|| {
                unique.push(node.content.as_str());
                unique.len() - 1
            });
            slots.push(slot);
        }

        let batch = self.gates.max_embedding_batch;
        let provider = Arc::clone(&self.provider);
        let work = async {
            let mut vectors = Vec::with_capacity(unique.len());
            for chunk in unique.chunks(batch) {
                let mut out = provider.encode(chunk).await?;
                if out.len() != chunk.len() {
                    return Err(AimosError::Internal(format!(
                        "embedding provider returned {} vectors for {} texts",
                        out.len(),
                        chunk.len()
                    )));
                }
                vectors.append(&mut out);
            }
            Ok::<_, AimosError>(vectors)
        };
        let vectors: Vec<Vec<f32>> = tokio::time::timeout(self.gates.indexing_timeout, work)
            .await
            .map_err(|_| {
                AimosError::Timeout(format!(
                    "index embedding exceeded {:?}",
                    self.gates.indexing_timeout
                ))
            })??;

        for (node, slot) in nodes.iter_mut().zip(slots) {
            node.embedding = vectors[slot].clone();
        }
        Ok(())
    }

    /// Drop every node of a document. Returns how many were removed.
    pub fn remove_document(&self, doc_id: &str) -> usize {
        let removed = self.state.write().evict(doc_id);
        if removed > 0 {
            info!(doc_id, removed, "Evicted document from index");
        }
        removed
    }

    pub fn root_id(&self, doc_id: &str) -> Option<String> {
        self.state.read().roots.get(doc_id).cloned()
    }

    pub fn documents(&self) -> Vec<String> {
        self.state.read().roots.keys().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn get_node(&self, node_id: &str) -> Option<IndexNode> {
        self.state.read().nodes.get(node_id).cloned()
    }

    /// Children of a node, in order.
    pub fn zoom_in(&self, node_id: &str) -> AimosResult<Vec<IndexNode>> {
        let state = self.state.read();
        let node = state
            .nodes
            .get(node_id)
            .ok_or_else(|| AimosError::NotFound(format!("index node {node_id}")))?;
        Ok(node
            .children
            .iter()
            .filter_map(|c| state.nodes.get(c).cloned())
            .collect())
    }

    /// Parent of a node; `None` at the root.
    pub fn zoom_out(&self, node_id: &str) -> AimosResult<Option<IndexNode>> {
        let state = self.state.read();
        let node = state
            .nodes
            .get(node_id)
            .ok_or_else(|| AimosError::NotFound(format!("index node {node_id}")))?;
        Ok(node
            .parent_id
            .as_ref()
            .and_then(|p| state.nodes.get(p).cloned()))
    }

    /// Parent (optional), then siblings (optional), then the node itself.
    pub fn get_context(
        &self,
        node_id: &str,
        include_parent: bool,
        include_siblings: bool,
    ) -> AimosResult<Vec<IndexNode>> {
        let state = self.state.read();
        let node = state
            .nodes
            .get(node_id)
            .ok_or_else(|| AimosError::NotFound(format!("index node {node_id}")))?;
        let parent = node.parent_id.as_ref().and_then(|p| state.nodes.get(p));
        let mut context = Vec::new();
        if include_parent {
            if let Some(parent) = parent {
                context.push(parent.clone());
            }
        }
        if include_siblings {
            if let Some(parent) = parent {
                context.extend(
                    parent
                        .children
                        .iter()
                        .filter(|c| c.as_str() != node_id)
                        .filter_map(|c| state.nodes.get(c).cloned()),
                );
            }
        }
        context.push(node.clone());
        Ok(context)
    }

    /// Breadth-first descendants down to `depth` levels.
    pub fn descendants(&self, node_id: &str, depth: usize) -> AimosResult<Vec<IndexNode>> {
        self.query_gates.check_depth(depth)?;
        let state = self.state.read();
        if !state.nodes.contains_key(node_id) {
            return Err(AimosError::NotFound(format!("index node {node_id}")));
        }
        let mut out = Vec::new();
        let mut queue = VecDeque::from([(node_id.to_string(), 0usize)]);
        while let Some((id, d)) = queue.pop_front() {
            let Some(node) = state.nodes.get(&id) else {
                continue;
            };
            if d > 0 {
                out.push(node.clone());
            }
            if d < depth {
                queue.extend(node.children.iter().map(|c| (c.clone(), d + 1)));
            }
        }
        Ok(out)
    }

    /// Every node of a document, root first, breadth-first.
    pub fn document_nodes(&self, doc_id: &str) -> Vec<IndexNode> {
        let Some(root) = self.root_id(doc_id) else {
            return Vec::new();
        };
        let state = self.state.read();
        let mut out = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            if let Some(node) = state.nodes.get(&id) {
                queue.extend(node.children.iter().cloned());
                out.push(node.clone());
            }
        }
        out
    }

    /// Visit every node at `level` under the read lock, in id order.
    pub fn scan_level(&self, level: IndexLevel, mut visit: impl FnMut(&IndexNode)) {
        let state = self.state.read();
        for node in state.nodes.values().filter(|n| n.level == level) {
            visit(node);
        }
    }

    /// Lexical query: token overlap divided by sqrt(query token count).
    pub fn query(
        &self,
        text: &str,
        level: IndexLevel,
        top_k: usize,
    ) -> AimosResult<Vec<(IndexNode, f64)>> {
        let query_tokens: HashSet<String> = word_tokens(text).into_iter().collect();
        if query_tokens.is_empty() {
            return Err(AimosError::validation("query text must be non-empty"));
        }
        let norm = (query_tokens.len() as f64).sqrt();
        let mut scored = Vec::new();
        self.scan_level(level, |node| {
            let node_tokens: HashSet<String> = word_tokens(&node.content).into_iter().collect();
            let overlap = query_tokens.intersection(&node_tokens).count();
            if overlap > 0 {
                scored.push((node.clone(), overlap as f64 / norm));
            }
        });
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
        scored.truncate(self.query_gates.clamp_results(top_k));
        Ok(scored)
    }

    /// Serializable copy of the whole index.
    pub fn export(&self) -> IndexExport {
        let state = self.state.read();
        IndexExport {
            version: EXPORT_VERSION,
            provider: self.provider.name().to_string(),
            dimensions: self.provider.dimensions(),
            roots: state.roots.clone(),
            nodes: state.nodes.values().cloned().collect(),
        }
    }

    /// Rebuild an index from an export. Roots missing from the export are
    /// inferred from parentless SYSTEM nodes.
    pub fn from_export(
        export: IndexExport,
        provider: Arc<dyn EmbeddingProvider>,
        gates: SafetyGates,
        query_gates: QueryGates,
    ) -> AimosResult<Self> {
        if export.version != EXPORT_VERSION {
            return Err(AimosError::Serialization(format!(
                "unsupported index export version {}",
                export.version
            )));
        }
        let mut state = IndexState::default();
        for node in export.nodes {
            if node.parent_id.is_none() && node.level == IndexLevel::System {
                state
                    .roots
                    .entry(node.doc_id.clone())
                    .or_insert_with(|| node.id.clone());
            }
            state.nodes.insert(node.id.clone(), node);
        }
        for (doc_id, root) in export.roots {
            if !state.nodes.contains_key(&root) {
                return Err(AimosError::Corruption(format!(
                    "index export names missing root {root} for {doc_id}"
                )));
            }
            state.roots.insert(doc_id, root);
        }
        let index = Self::with_gates(provider, gates, query_gates);
        *index.state.write() = state;
        Ok(index)
    }

    pub fn to_json(&self) -> AimosResult<String> {
        Ok(serde_json::to_string(&self.export())?)
    }

    pub fn from_json(raw: &str, provider: Arc<dyn EmbeddingProvider>) -> AimosResult<Self> {
        let export: IndexExport = serde_json::from_str(raw)?;
        Self::from_export(export, provider, SafetyGates::default(), QueryGates::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;

    const DOC: &str = "# Overview\nThe system stores atoms. It also snapshots them.\n\n\
                       Readers replay snapshots.\n\n# Index\nThe index has five levels.";

    fn index() -> HierarchicalIndex {
        HierarchicalIndex::new(Arc::new(HashingEmbedder::new(64)))
    }

    #[tokio::test]
    async fn test_index_document_builds_tree() {
        let idx = index();
        let root = idx.index_document(DOC, "d1").await.unwrap();
        assert_eq!(root, "doc:d1");
        let sections = idx.zoom_in(&root).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].summary, "Overview");
        assert_eq!(sections[1].id, "sec:d1:1");
        let paras = idx.zoom_in("sec:d1:0").unwrap();
        assert_eq!(paras.len(), 2);
        let sents = idx.zoom_in("para:d1:0:0").unwrap();
        assert_eq!(sents.len(), 2);
        assert_eq!(sents[1].content, "It also snapshots them.");
        let toks = idx.zoom_in("sent:d1:0:0:0").unwrap();
        assert_eq!(toks.last().unwrap().content, ".");
        assert_eq!(toks[0].metadata["token_index"], json!(0));
        assert!(toks.iter().all(|t| t.embedding.len() == 64));
    }

    #[tokio::test]
    async fn test_zoom_out_and_context() {
        let idx = index();
        idx.index_document(DOC, "d1").await.unwrap();
        let parent = idx.zoom_out("para:d1:0:1").unwrap().unwrap();
        assert_eq!(parent.id, "sec:d1:0");
        assert!(idx.zoom_out("doc:d1").unwrap().is_none());
        let ctx = idx.get_context("para:d1:0:1", true, true).unwrap();
        let ids: Vec<&str> = ctx.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["sec:d1:0", "para:d1:0:0", "para:d1:0:1"]);
        assert_eq!(idx.zoom_in("missing").unwrap_err().kind(), "not_found");
    }

    #[tokio::test]
    async fn test_query_ranks_by_overlap() {
        let idx = index();
        idx.index_document(DOC, "d1").await.unwrap();
        let hits = idx.query("five levels", IndexLevel::Sentence, 3).unwrap();
        assert_eq!(hits[0].0.id, "sent:d1:1:0:0");
        assert!((hits[0].1 - 2.0 / 2f64.sqrt()).abs() < 1e-9);
        assert_eq!(idx.query("  ", IndexLevel::Sentence, 3).unwrap_err().kind(), "validation_error");
    }

    #[tokio::test]
    async fn test_reindex_replaces_and_remove_evicts() {
        let idx = index();
        idx.index_document(DOC, "d1").await.unwrap();
        idx.index_document("Just one line.", "d2").await.unwrap();
        let before = idx.node_count();
        idx.index_document("Replaced text.", "d1").await.unwrap();
        assert!(idx.node_count() < before);
        assert_eq!(idx.get_node("sec:d1:0").unwrap().summary, "Section 1");
        let removed = idx.remove_document("d1");
        assert!(removed > 0);
        assert!(idx.root_id("d1").is_none());
        assert_eq!(idx.documents(), vec!["d2".to_string()]);
    }

    #[tokio::test]
    async fn test_node_budget_enforced() {
        let gates = SafetyGates {
            max_nodes_per_atom: 10,
            ..SafetyGates::default()
        };
        let idx = HierarchicalIndex::with_gates(
            Arc::new(HashingEmbedder::new(8)),
            gates,
            QueryGates::default(),
        );
        let err = idx.index_document(DOC, "d1").await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert_eq!(idx.node_count(), 0);
    }

    #[tokio::test]
    async fn test_descendants_respects_depth_gate() {
        let idx = index();
        idx.index_document(DOC, "d1").await.unwrap();
        let two = idx.descendants("doc:d1", 2).unwrap();
        assert!(two.iter().all(|n| n.level <= IndexLevel::Paragraph));
        assert_eq!(two.len(), 2 + 3);
        assert!(idx.descendants("doc:d1", 6).is_err());
    }

    #[tokio::test]
    async fn test_export_round_trip() {
        let idx = index();
        idx.index_document(DOC, "d1").await.unwrap();
        let raw = idx.to_json().unwrap();
        let restored = HierarchicalIndex::from_json(&raw, Arc::new(HashingEmbedder::new(64))).unwrap();
        assert_eq!(restored.root_id("d1"), idx.root_id("d1"));
        assert_eq!(restored.node_count(), idx.node_count());
        assert_eq!(
            restored.get_node("para:d1:0:1").unwrap().summary,
            "Readers replay snapshots."
        );
    }
}
