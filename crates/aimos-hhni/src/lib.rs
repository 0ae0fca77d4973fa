//! Hierarchical index and budgeted retrieval for AIMOS.
//!
//! Documents are parsed into a five-level tree with one embedding per node.
//! Retrieval runs a coarse cosine search, refines the candidates with the
//! DVNS force simulation, folds duplicates, resolves stance conflicts and
//! packs the survivors into a token budget.

pub mod budget;
pub mod compress;
pub mod conflict;
pub mod dedup;
pub mod dvns;
pub mod embedding;
pub mod index;
pub mod pool;
pub mod retrieval;
pub mod safety;
pub mod search;
pub mod text;

pub use budget::{BudgetItem, BudgetResult, TokenBudgetManager};
pub use embedding::{EmbeddingProvider, HashingEmbedder, ProviderRegistry};
pub use index::{HierarchicalIndex, IndexNode};
pub use retrieval::{RetrievalResult, TwoStageRetriever};
pub use search::SemanticSearchEngine;
