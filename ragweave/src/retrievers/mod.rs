//! Retrievers: per-index lookups and the compositors built over them.

mod auto_merging;
mod bm25;
mod fusion;
mod keyword_table;
mod knowledge_graph;
mod router;
mod summary;
mod tree;
mod vector;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::EmbeddingModel;
use crate::schema::{MetadataFilters, NodeWithScore, QueryBundle};

pub use auto_merging::{AutoMergingConfig, AutoMergingRetriever};
pub use bm25::Bm25Retriever;
pub use fusion::{FusionConfig, FusionMode, QueryFusionRetriever};
pub use keyword_table::KeywordTableRetriever;
pub use knowledge_graph::{KgRetrieverConfig, KgRetrieverMode, KnowledgeGraphRetriever};
pub use router::RouterRetriever;
pub use summary::{SummaryRetriever, SummaryRetrieverConfig, SummaryRetrieverMode};
pub use tree::{TreeRetriever, TreeRetrieverMode};
pub use vector::VectorIndexRetriever;

/// Returns candidate nodes for a query, best first.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &QueryBundle) -> Result<Vec<NodeWithScore>>;

    async fn retrieve_str(&self, query: &str) -> Result<Vec<NodeWithScore>> {
        self.retrieve(&QueryBundle::new(query)).await
    }
}

/// Options accepted by `Index::as_retriever`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrieverOptions {
    /// Index-specific retrieval mode name; `None` selects the index default.
    pub mode: Option<String>,
    pub similarity_top_k: Option<usize>,
    pub filters: Option<MetadataFilters>,
}

impl RetrieverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn similarity_top_k(mut self, top_k: usize) -> Self {
        self.similarity_top_k = Some(top_k);
        self
    }

    pub fn filters(mut self, filters: MetadataFilters) -> Self {
        self.filters = Some(filters);
        self
    }
}

/// The query's embedding, computed with `embed_model` when not supplied.
pub(crate) async fn query_embedding(
    embed_model: &Arc<dyn EmbeddingModel>,
    query: &QueryBundle,
) -> Result<Vec<f32>> {
    match &query.embedding {
        Some(embedding) => Ok(embedding.clone()),
        None => embed_model.query_embedding(&query.query_str).await,
    }
}

/// Sort best first, breaking ties by node id so merges are deterministic.
pub(crate) fn sort_with_ties(nodes: &mut [NodeWithScore]) {
    nodes.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.node.id.cmp(&b.node.id))
    });
}
