//! Vector store trait and the in-memory [`SimpleVectorStore`].

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{RagError, Result};
use crate::models::{mmr_by_similarity, top_k_by_similarity};
use crate::schema::{Metadata, MetadataFilters, Node};

/// Default relevance/diversity trade-off for MMR queries.
pub const DEFAULT_MMR_THRESHOLD: f32 = 0.5;

/// How a query is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorStoreQueryMode {
    /// Dense top-k by similarity.
    #[default]
    Default,
    /// Sparse lexical vectors.
    Sparse,
    /// Dense plus sparse.
    Hybrid,
    /// Maximal marginal relevance.
    Mmr,
}

/// A query against a [`VectorStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct VectorStoreQuery {
    pub query_embedding: Option<Vec<f32>>,
    pub similarity_top_k: usize,
    pub filters: Option<MetadataFilters>,
    pub mode: VectorStoreQueryMode,
    /// Restrict to these node ids.
    pub node_ids: Option<Vec<String>>,
    /// Restrict to nodes derived from these source documents.
    pub doc_ids: Option<Vec<String>>,
    /// MMR trade-off; [`DEFAULT_MMR_THRESHOLD`] when unset.
    pub mmr_threshold: Option<f32>,
    pub query_str: Option<String>,
}

impl VectorStoreQuery {
    /// Default-mode query for `embedding`.
    pub fn new(embedding: Vec<f32>, similarity_top_k: usize) -> Self {
        Self {
            query_embedding: Some(embedding),
            similarity_top_k,
            filters: None,
            mode: VectorStoreQueryMode::Default,
            node_ids: None,
            doc_ids: None,
            mmr_threshold: None,
            query_str: None,
        }
    }

    pub fn with_filters(mut self, filters: Option<MetadataFilters>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_mode(mut self, mode: VectorStoreQueryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_node_ids(mut self, node_ids: Vec<String>) -> Self {
        self.node_ids = Some(node_ids);
        self
    }

    pub fn with_doc_ids(mut self, doc_ids: Vec<String>) -> Self {
        self.doc_ids = Some(doc_ids);
        self
    }
}

/// Matches ordered best first. `nodes` is `None` when text lives in the docstore.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VectorStoreQueryResult {
    pub ids: Vec<String>,
    pub similarities: Vec<f32>,
    pub nodes: Option<Vec<Node>>,
}

/// A storage backend for node embeddings with similarity search.
///
/// # Example
///
/// ```rust,ignore
/// use ragweave::storage::{SimpleVectorStore, VectorStore, VectorStoreQuery};
///
/// let store = SimpleVectorStore::new();
/// store.add(&nodes).await?;
/// let result = store.query(&VectorStoreQuery::new(query_embedding, 5)).await?;
/// ```
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Whether node text is kept alongside vectors. When false, text lives in the docstore.
    fn stores_text(&self) -> bool;

    /// Store nodes; every node must carry an embedding. Returns the text-store ids.
    async fn add(&self, nodes: &[Node]) -> Result<Vec<String>>;

    /// Delete every entry derived from `ref_doc_id`.
    async fn delete(&self, ref_doc_id: &str) -> Result<()>;

    /// Delete entries by node id.
    async fn delete_nodes(&self, node_ids: &[String]) -> Result<()>;

    /// Search, ordered by descending similarity.
    async fn query(&self, query: &VectorStoreQuery) -> Result<VectorStoreQueryResult>;

    /// Write the store to `path`. Remote backends ignore this.
    async fn persist(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Serializable contents of a [`SimpleVectorStore`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SimpleVectorStoreData {
    #[serde(default)]
    pub embedding_dict: BTreeMap<String, Vec<f32>>,
    #[serde(default)]
    pub text_id_to_ref_doc_id: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata_dict: BTreeMap<String, Metadata>,
}

/// An in-memory vector store using cosine similarity for search.
///
/// Keeps embeddings, source ids and metadata (for filters); node text is kept in
/// the docstore.
#[derive(Debug, Default)]
pub struct SimpleVectorStore {
    data: RwLock<SimpleVectorStoreData>,
}

impl SimpleVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dict(data: SimpleVectorStoreData) -> Self {
        Self { data: RwLock::new(data) }
    }

    pub async fn to_dict(&self) -> SimpleVectorStoreData {
        self.data.read().await.clone()
    }

    /// Load a store written by [`VectorStore::persist`]. A missing file yields an empty store.
    pub fn from_persist_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no persisted vector store, starting empty");
            return Ok(Self::new());
        }
        let bytes = fs::read(path)?;
        let data = serde_json::from_slice(&bytes)
            .map_err(|e| RagError::Decode(format!("{}: {e}", path.display())))?;
        Ok(Self::from_dict(data))
    }

    /// Embedding stored for `text_id`.
    pub async fn get(&self, text_id: &str) -> Option<Vec<f32>> {
        self.data.read().await.embedding_dict.get(text_id).cloned()
    }
}

#[async_trait]
impl VectorStore for SimpleVectorStore {
    fn stores_text(&self) -> bool {
        false
    }

    async fn add(&self, nodes: &[Node]) -> Result<Vec<String>> {
        let mut data = self.data.write().await;
        let mut ids = Vec::with_capacity(nodes.len());
        for node in nodes {
            let embedding = node.embedding()?.to_vec();
            data.embedding_dict.insert(node.id.clone(), embedding);
            if let Some(ref_doc_id) = node.ref_doc_id() {
                data.text_id_to_ref_doc_id.insert(node.id.clone(), ref_doc_id.to_string());
            }
            data.metadata_dict.insert(node.id.clone(), node.metadata.clone());
            ids.push(node.id.clone());
        }
        Ok(ids)
    }

    async fn delete(&self, ref_doc_id: &str) -> Result<()> {
        let mut data = self.data.write().await;
        let doomed: Vec<String> = data
            .text_id_to_ref_doc_id
            .iter()
            .filter(|(_, r)| r.as_str() == ref_doc_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            data.embedding_dict.remove(id);
            data.text_id_to_ref_doc_id.remove(id);
            data.metadata_dict.remove(id);
        }
        debug!(ref_doc_id, removed = doomed.len(), "deleted vectors for ref doc");
        Ok(())
    }

    async fn delete_nodes(&self, node_ids: &[String]) -> Result<()> {
        let mut data = self.data.write().await;
        for id in node_ids {
            data.embedding_dict.remove(id);
            data.text_id_to_ref_doc_id.remove(id);
            data.metadata_dict.remove(id);
        }
        Ok(())
    }

    async fn query(&self, query: &VectorStoreQuery) -> Result<VectorStoreQueryResult> {
        if matches!(query.mode, VectorStoreQueryMode::Sparse | VectorStoreQueryMode::Hybrid) {
            return Err(RagError::Unsupported(format!(
                "{:?} queries on the simple vector store; use the BM25 retriever with fusion",
                query.mode
            )));
        }
        let embedding = query.query_embedding.as_deref().ok_or_else(|| {
            RagError::InvalidArgument("vector query requires a query embedding".to_string())
        })?;

        let data = self.data.read().await;
        let node_filter: Option<BTreeSet<&str>> =
            query.node_ids.as_ref().map(|ids| ids.iter().map(String::as_str).collect());
        let doc_filter: Option<BTreeSet<&str>> =
            query.doc_ids.as_ref().map(|ids| ids.iter().map(String::as_str).collect());
        let empty = Metadata::new();

        let candidates: Vec<(&String, &[f32])> = data
            .embedding_dict
            .iter()
            .filter(|(id, _)| node_filter.as_ref().is_none_or(|set| set.contains(id.as_str())))
            .filter(|(id, _)| {
                doc_filter.as_ref().is_none_or(|set| {
                    data.text_id_to_ref_doc_id.get(*id).is_some_and(|r| set.contains(r.as_str()))
                })
            })
            .filter(|(id, _)| {
                query.filters.as_ref().is_none_or(|f| {
                    f.matches(data.metadata_dict.get(*id).unwrap_or(&empty))
                })
            })
            .map(|(id, emb)| (id, emb.as_slice()))
            .collect();

        let picks = match query.mode {
            VectorStoreQueryMode::Mmr => {
                let vectors: Vec<&[f32]> = candidates.iter().map(|(_, e)| *e).collect();
                mmr_by_similarity(
                    embedding,
                    &vectors,
                    query.similarity_top_k,
                    query.mmr_threshold.unwrap_or(DEFAULT_MMR_THRESHOLD),
                )?
            }
            _ => top_k_by_similarity(
                embedding,
                candidates.iter().map(|(_, e)| *e),
                query.similarity_top_k,
            )?,
        };

        let (ids, similarities) =
            picks.into_iter().map(|(i, score)| (candidates[i].0.clone(), score)).unzip();
        Ok(VectorStoreQueryResult { ids, similarities, nodes: None })
    }

    async fn persist(&self, path: &Path) -> Result<()> {
        let data = self.data.read().await;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec(&*data)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Document, MetadataFilter, NodeRelationship};

    fn node(id: &str, doc: &str, emb: Vec<f32>) -> Node {
        Node::with_id(id, id)
            .with_metadata("doc", doc)
            .with_relationship(NodeRelationship::Source, Document::new(doc, "").as_related_info())
            .with_embedding(emb)
    }

    async fn store() -> SimpleVectorStore {
        let store = SimpleVectorStore::new();
        store
            .add(&[
                node("a", "d1", vec![1.0, 0.0]),
                node("b", "d1", vec![0.7, 0.7]),
                node("c", "d2", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn query_orders_by_similarity() {
        let store = store().await;
        let result = store.query(&VectorStoreQuery::new(vec![1.0, 0.1], 2)).await.unwrap();
        assert_eq!(result.ids, vec!["a", "b"]);
        assert!(result.similarities[0] >= result.similarities[1]);
        assert!(result.nodes.is_none());
    }

    #[tokio::test]
    async fn filters_and_doc_ids_restrict_candidates() {
        let store = store().await;
        let q = VectorStoreQuery::new(vec![1.0, 0.0], 3)
            .with_filters(Some(MetadataFilters::all([MetadataFilter::equals("doc", "d2")])));
        assert_eq!(store.query(&q).await.unwrap().ids, vec!["c"]);

        let q = VectorStoreQuery::new(vec![1.0, 0.0], 3).with_doc_ids(vec!["d1".into()]);
        assert_eq!(store.query(&q).await.unwrap().ids.len(), 2);
    }

    #[tokio::test]
    async fn delete_by_ref_doc() {
        let store = store().await;
        store.delete("d1").await.unwrap();
        let result = store.query(&VectorStoreQuery::new(vec![1.0, 0.0], 5)).await.unwrap();
        assert_eq!(result.ids, vec!["c"]);
    }

    #[tokio::test]
    async fn sparse_mode_is_unsupported() {
        let store = store().await;
        let q = VectorStoreQuery::new(vec![1.0, 0.0], 1).with_mode(VectorStoreQueryMode::Sparse);
        assert!(matches!(store.query(&q).await, Err(RagError::Unsupported(_))));
    }

    #[tokio::test]
    async fn dimension_mismatch_and_missing_embedding() {
        let store = store().await;
        let q = VectorStoreQuery::new(vec![1.0, 0.0, 0.0], 1);
        assert!(matches!(store.query(&q).await, Err(RagError::InvalidArgument(_))));
        let err = store.add(&[Node::with_id("x", "no vector")]).await.unwrap_err();
        assert!(matches!(err, RagError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn mmr_prefers_diverse_results() {
        let store = SimpleVectorStore::new();
        store
            .add(&[
                node("a", "d", vec![1.0, 0.0, 0.0]),
                node("a_dup", "d", vec![1.0, 0.05, 0.0]),
                node("b", "d", vec![0.0, 0.0, 1.0]),
            ])
            .await
            .unwrap();
        let q = VectorStoreQuery::new(vec![1.0, 0.0, 0.5], 2).with_mode(VectorStoreQueryMode::Mmr);
        assert_eq!(store.query(&q).await.unwrap().ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn persist_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vector_store.json");
        let store = store().await;
        store.persist(&path).await.unwrap();
        let loaded = SimpleVectorStore::from_persist_path(&path).unwrap();
        assert_eq!(loaded.to_dict().await, store.to_dict().await);
    }
}
