//! `aimos retrieve`: index documents, then run the two-stage retriever.

use super::{block_on, to_json, Context};
use crate::cli::RetrieveArgs;
use aimos_hhni::{HierarchicalIndex, SemanticSearchEngine, TwoStageRetriever};
use aimos_types::{AimosError, AimosResult};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

/// `(doc_id, text)` pairs to index: the given files, else every inline
/// text atom in the store.
fn collect_documents(ctx: &Context, args: &RetrieveArgs) -> AimosResult<Vec<(String, String)>> {
    if !args.files.is_empty() {
        return args
            .files
            .iter()
            .map(|path| {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    AimosError::validation(format!("cannot read {}: {e}", path.display()))
                })?;
                let doc_id = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                Ok((doc_id, text))
            })
            .collect();
    }

    let store = ctx.open_store()?;
    Ok(store
        .list_atoms(None, 0, None)?
        .into_iter()
        .filter_map(|atom| atom.text().map(|t| (atom.id.clone(), t.to_string())))
        .filter(|(_, text)| !text.trim().is_empty())
        .collect())
}

async fn index_and_retrieve(
    index: &HierarchicalIndex,
    retriever: &TwoStageRetriever,
    documents: &[(String, String)],
    args: &RetrieveArgs,
    budget: usize,
) -> AimosResult<Value> {
    for (doc_id, text) in documents {
        index.index_document(text, doc_id).await?;
    }
    info!(documents = documents.len(), nodes = index.node_count(), "Indexed retrieval corpus");

    let provider = args.provider.as_deref();
    if args.baseline {
        let (dvns, baseline, lift) = retriever
            .retrieve_with_baseline_comparison(&args.query, budget, provider)
            .await?;
        Ok(json!({ "dvns": dvns, "baseline": baseline, "rs_lift": lift }))
    } else {
        to_json(&retriever.retrieve(&args.query, budget, provider).await?)
    }
}

pub fn run(ctx: &Context, args: RetrieveArgs) -> AimosResult<Value> {
    let documents = collect_documents(ctx, &args)?;
    if documents.is_empty() {
        return Err(AimosError::validation(
            "nothing to retrieve from: pass --file or add text atoms first",
        ));
    }
    let budget = args.budget.unwrap_or(ctx.config.retrieval.token_budget);

    let providers = ctx.providers();
    let index = Arc::new(ctx.index(&providers));
    let search = Arc::new(SemanticSearchEngine::new(index.clone(), providers));
    let retriever = TwoStageRetriever::new(search, ctx.config.retrieval.clone());

    block_on(index_and_retrieve(&index, &retriever, &documents, &args, budget))?
}
