use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::data_structs::IndexDict;
use crate::error::Result;
use crate::models::EmbeddingModel;
use crate::schema::{MetadataFilters, NodeWithScore, QueryBundle};
use crate::storage::{DocStore, VectorStore, VectorStoreQuery, VectorStoreQueryMode};

use super::{Retriever, query_embedding};

/// Nearest-neighbour lookup against a vector store.
///
/// Results come back in the store's order. When the store does not keep text,
/// nodes are resolved through the docstore.
pub struct VectorIndexRetriever {
    vector_store: Arc<dyn VectorStore>,
    docstore: Arc<DocStore>,
    index_struct: Arc<RwLock<IndexDict>>,
    embed_model: Arc<dyn EmbeddingModel>,
    similarity_top_k: usize,
    mode: VectorStoreQueryMode,
    filters: Option<MetadataFilters>,
    node_ids: Option<Vec<String>>,
    doc_ids: Option<Vec<String>>,
}

impl VectorIndexRetriever {
    pub fn new(
        vector_store: Arc<dyn VectorStore>,
        docstore: Arc<DocStore>,
        index_struct: Arc<RwLock<IndexDict>>,
        embed_model: Arc<dyn EmbeddingModel>,
        similarity_top_k: usize,
    ) -> Self {
        Self {
            vector_store,
            docstore,
            index_struct,
            embed_model,
            similarity_top_k,
            mode: VectorStoreQueryMode::Default,
            filters: None,
            node_ids: None,
            doc_ids: None,
        }
    }

    pub fn with_mode(mut self, mode: VectorStoreQueryMode) -> Self {
        self.mode = mode;
        self
    }

    /// Filters applied when the query carries none of its own.
    pub fn with_filters(mut self, filters: Option<MetadataFilters>) -> Self {
        self.filters = filters;
        self
    }

    /// Restrict candidates to these node ids.
    pub fn with_node_ids(mut self, node_ids: Vec<String>) -> Self {
        self.node_ids = Some(node_ids);
        self
    }

    /// Restrict candidates to nodes of these source documents.
    pub fn with_doc_ids(mut self, doc_ids: Vec<String>) -> Self {
        self.doc_ids = Some(doc_ids);
        self
    }
}

#[async_trait]
impl Retriever for VectorIndexRetriever {
    async fn retrieve(&self, query: &QueryBundle) -> Result<Vec<NodeWithScore>> {
        let embedding = query_embedding(&self.embed_model, query).await?;
        let mut store_query = VectorStoreQuery::new(embedding, self.similarity_top_k)
            .with_filters(query.filters.clone().or_else(|| self.filters.clone()))
            .with_mode(self.mode);
        store_query.query_str = Some(query.query_str.clone());
        if let Some(ids) = &self.node_ids {
            store_query = store_query.with_node_ids(ids.clone());
        }
        if let Some(ids) = &self.doc_ids {
            store_query = store_query.with_doc_ids(ids.clone());
        }

        let result = self.vector_store.query(&store_query).await?;
        let hits = match result.nodes {
            Some(nodes) => nodes
                .into_iter()
                .zip(result.similarities)
                .map(|(node, score)| NodeWithScore::new(node, score))
                .collect(),
            None => {
                let node_ids: Vec<String> = {
                    let index_struct = self.index_struct.read();
                    result
                        .ids
                        .iter()
                        .map(|text_id| {
                            index_struct.nodes_dict.get(text_id).unwrap_or(text_id).clone()
                        })
                        .collect()
                };
                let nodes = self.docstore.get_nodes(&node_ids)?;
                nodes
                    .into_iter()
                    .zip(result.similarities)
                    .map(|(node, score)| NodeWithScore::new(node, score))
                    .collect::<Vec<_>>()
            }
        };
        debug!(hits = hits.len(), top_k = self.similarity_top_k, "vector retrieval");
        Ok(hits)
    }
}
