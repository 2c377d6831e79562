use async_trait::async_trait;
use tracing::debug;

use crate::bm25::{Bm25, Bm25Config, SparseEmbedding};
use crate::error::{RagError, Result};
use crate::schema::{MetadataMode, Node, NodeWithScore, QueryBundle};
use crate::storage::DocStore;

/// Lexical retriever scoring a fixed node set with BM25.
///
/// The model is fitted once at construction; rebuild the retriever after the
/// corpus changes. Terms present in every node score 0, so a single-node
/// corpus retrieves nothing.
#[derive(Debug, Clone)]
pub struct Bm25Retriever {
    model: Bm25,
    nodes: Vec<Node>,
    similarity_top_k: usize,
}

impl Bm25Retriever {
    /// # Errors
    ///
    /// Returns [`RagError::InvalidArgument`] if `similarity_top_k` is zero.
    pub fn from_nodes(
        nodes: Vec<Node>,
        config: Bm25Config,
        similarity_top_k: usize,
    ) -> Result<Self> {
        if similarity_top_k == 0 {
            return Err(RagError::InvalidArgument("similarity_top_k must be at least 1".into()));
        }
        let corpus: Vec<String> = nodes.iter().map(|n| n.content(MetadataMode::None)).collect();
        let model = Bm25::fit(&corpus, config);
        debug!(docs = nodes.len(), "fitted bm25 retriever");
        Ok(Self { model, nodes, similarity_top_k })
    }

    /// Fit over every node in `docstore`.
    pub fn from_docstore(
        docstore: &DocStore,
        config: Bm25Config,
        similarity_top_k: usize,
    ) -> Result<Self> {
        let nodes: Vec<Node> = docstore.docs()?.into_values().collect();
        Self::from_nodes(nodes, config, similarity_top_k)
    }

    pub fn similarity_top_k(&self) -> usize {
        self.similarity_top_k
    }

    pub fn model(&self) -> &Bm25 {
        &self.model
    }

    pub fn sparse_embedding_for_query(&self, query: &str) -> SparseEmbedding {
        self.model.sparse_embedding_for_query(query)
    }

    /// Sparse vector of the node with `node_id`, if it is in the corpus.
    pub fn sparse_embedding_for_doc(&self, node_id: &str) -> Option<SparseEmbedding> {
        let position = self.nodes.iter().position(|n| n.id == node_id)?;
        Some(self.model.sparse_embedding_for_doc(position))
    }
}

#[async_trait]
impl super::Retriever for Bm25Retriever {
    async fn retrieve(&self, query: &QueryBundle) -> Result<Vec<NodeWithScore>> {
        let ranked = self.model.top_k(&query.query_str, self.similarity_top_k);
        debug!(hits = ranked.len(), "bm25 retrieval");
        Ok(ranked
            .into_iter()
            .map(|(i, score)| NodeWithScore::new(self.nodes[i].clone(), score))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrievers::Retriever;

    fn nodes() -> Vec<Node> {
        vec![
            Node::with_id("ml", "machine learning models learn from data"),
            Node::with_id("dl", "deep learning is a branch of machine learning"),
            Node::with_id("wx", "the weather today is sunny"),
            Node::with_id("food", "cooking pasta requires boiling water"),
        ]
    }

    #[tokio::test]
    async fn ranks_only_matching_nodes() {
        let retriever = Bm25Retriever::from_nodes(nodes(), Bm25Config::default(), 3).unwrap();
        let hits = retriever.retrieve_str("machine learning").await.unwrap();
        assert_eq!(hits.len(), 2);
        let mut ids: Vec<&str> = hits.iter().map(|h| h.id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["dl", "ml"]);
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn docstore_corpus_and_sparse_vectors() {
        let docstore = DocStore::in_memory();
        docstore.add_documents(&nodes(), true).unwrap();
        let retriever = Bm25Retriever::from_docstore(&docstore, Bm25Config::default(), 2).unwrap();
        let hits = retriever.retrieve_str("pasta").await.unwrap();
        assert_eq!(hits[0].id(), "food");

        let q = retriever.sparse_embedding_for_query("pasta");
        let d = retriever.sparse_embedding_for_doc("food").unwrap();
        assert!((q.dot(&d) - hits[0].score).abs() < 1e-6);
        assert!(retriever.sparse_embedding_for_doc("missing").is_none());
    }

    #[test]
    fn zero_top_k_is_rejected() {
        assert!(Bm25Retriever::from_nodes(nodes(), Bm25Config::default(), 0).is_err());
    }
}
