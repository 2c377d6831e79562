//! Dense-vector index: embeddings in a vector store, text in the docstore.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::data_structs::{IndexDict, IndexStruct};
use crate::error::{RagError, Result};
use crate::models::embed_nodes;
use crate::retrievers::{Retriever, RetrieverOptions, VectorIndexRetriever};
use crate::schema::{Document, Node};
use crate::settings::Settings;
use crate::storage::{DEFAULT_VECTOR_STORE, StorageContext, VectorStore, VectorStoreQueryMode};

use super::{Index, new_index_id, parse_documents};

/// Default number of results per query.
pub const DEFAULT_SIMILARITY_TOP_K: usize = 2;

/// Vector index parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorIndexConfig {
    /// Nodes embedded and upserted per round trip.
    pub insert_batch_size: usize,
    /// Keep nodes in the docstore even when the vector store keeps text.
    pub store_nodes_override: bool,
    /// Which of the context's vector stores to use.
    pub vector_store_namespace: String,
    pub similarity_top_k: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            insert_batch_size: 2048,
            store_nodes_override: false,
            vector_store_namespace: DEFAULT_VECTOR_STORE.to_string(),
            similarity_top_k: DEFAULT_SIMILARITY_TOP_K,
        }
    }
}

impl VectorIndexConfig {
    pub fn builder() -> VectorIndexConfigBuilder {
        VectorIndexConfigBuilder::default()
    }
}

/// Builder for a validated [`VectorIndexConfig`].
#[derive(Debug, Clone, Default)]
pub struct VectorIndexConfigBuilder {
    config: VectorIndexConfig,
}

impl VectorIndexConfigBuilder {
    pub fn insert_batch_size(mut self, size: usize) -> Self {
        self.config.insert_batch_size = size;
        self
    }

    pub fn store_nodes_override(mut self, enabled: bool) -> Self {
        self.config.store_nodes_override = enabled;
        self
    }

    pub fn vector_store_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.vector_store_namespace = namespace.into();
        self
    }

    pub fn similarity_top_k(mut self, k: usize) -> Self {
        self.config.similarity_top_k = k;
        self
    }

    /// # Errors
    ///
    /// Returns [`RagError::InvalidArgument`] if the batch size or top-k is zero.
    pub fn build(self) -> Result<VectorIndexConfig> {
        if self.config.insert_batch_size == 0 {
            return Err(RagError::InvalidArgument("insert_batch_size must be > 0".into()));
        }
        if self.config.similarity_top_k == 0 {
            return Err(RagError::InvalidArgument("similarity_top_k must be > 0".into()));
        }
        Ok(self.config)
    }
}

/// Index over dense embeddings.
///
/// # Example
///
/// ```rust,ignore
/// use ragweave::indices::{Index, VectorIndexConfig, VectorStoreIndex};
///
/// let index = VectorStoreIndex::from_documents(
///     &docs,
///     StorageContext::from_defaults(),
///     Settings::global(),
///     VectorIndexConfig::default(),
/// )
/// .await?;
/// let nodes = index.as_retriever(&RetrieverOptions::new())?.retrieve_str("query").await?;
/// ```
pub struct VectorStoreIndex {
    index_struct: Arc<RwLock<IndexDict>>,
    storage: StorageContext,
    settings: Settings,
    config: VectorIndexConfig,
}

impl VectorStoreIndex {
    /// Build from pre-split nodes.
    pub async fn from_nodes(
        nodes: Vec<Node>,
        storage: StorageContext,
        settings: Settings,
        config: VectorIndexConfig,
    ) -> Result<Self> {
        let index = Self::from_struct(IndexDict::new(new_index_id()), storage, settings, config);
        index.add_nodes(nodes).await?;
        index.persist_struct()?;
        let nodes = index.index_struct.read().nodes_dict.len();
        info!(index_id = %index.index_id(), nodes, "built vector index");
        Ok(index)
    }

    /// Split `documents` with the settings' chunking, then build.
    pub async fn from_documents(
        documents: &[Document],
        storage: StorageContext,
        settings: Settings,
        config: VectorIndexConfig,
    ) -> Result<Self> {
        let nodes = parse_documents(documents, &settings, &storage)?;
        Self::from_nodes(nodes, storage, settings, config).await
    }

    /// Wrap an existing struct.
    pub fn from_struct(
        index_struct: IndexDict,
        storage: StorageContext,
        settings: Settings,
        config: VectorIndexConfig,
    ) -> Self {
        Self { index_struct: Arc::new(RwLock::new(index_struct)), storage, settings, config }
    }

    pub fn config(&self) -> &VectorIndexConfig {
        &self.config
    }

    /// The vector store this index writes to.
    pub fn vector_store(&self) -> Result<Arc<dyn VectorStore>> {
        self.storage.namespaced_vector_store(&self.config.vector_store_namespace).ok_or_else(|| {
            RagError::NotFound {
                kind: "vector store",
                id: self.config.vector_store_namespace.clone(),
            }
        })
    }

    fn persist_struct(&self) -> Result<()> {
        self.storage.index_store().add_index_struct(&self.index_struct())
    }

    async fn add_nodes(&self, nodes: Vec<Node>) -> Result<()> {
        let vector_store = self.vector_store()?;
        let keep_in_docstore = !vector_store.stores_text() || self.config.store_nodes_override;
        for batch in nodes.chunks(self.config.insert_batch_size.max(1)) {
            let mut batch = batch.to_vec();
            let batch_size = batch.len();
            embed_nodes(self.settings.embed_model.as_ref(), &mut batch, batch_size).await?;
            let text_ids = vector_store.add(&batch).await?;
            if keep_in_docstore {
                self.storage.docstore().add_documents(&batch, true)?;
                let mut index_struct = self.index_struct.write();
                for (node, text_id) in batch.iter().zip(&text_ids) {
                    index_struct.add_node(&node.id, text_id);
                }
            }
            debug!(batch = batch.len(), "inserted vector batch");
        }
        Ok(())
    }

    /// A retriever with explicit parameters.
    pub fn retriever(&self, options: &RetrieverOptions) -> Result<VectorIndexRetriever> {
        let mode = match options.mode.as_deref() {
            None | Some("default") => VectorStoreQueryMode::Default,
            Some("mmr") => VectorStoreQueryMode::Mmr,
            Some("sparse") => VectorStoreQueryMode::Sparse,
            Some("hybrid") => VectorStoreQueryMode::Hybrid,
            Some(other) => {
                return Err(RagError::InvalidArgument(format!(
                    "unknown vector retriever mode '{other}'"
                )));
            }
        };
        Ok(VectorIndexRetriever::new(
            self.vector_store()?,
            self.storage.docstore().clone(),
            self.index_struct.clone(),
            self.settings.embed_model.clone(),
            options.similarity_top_k.unwrap_or(self.config.similarity_top_k),
        )
        .with_mode(mode)
        .with_filters(options.filters.clone()))
    }
}

#[async_trait]
impl Index for VectorStoreIndex {
    fn index_id(&self) -> String {
        self.index_struct.read().index_id.clone()
    }

    fn index_struct(&self) -> IndexStruct {
        IndexStruct::Vector(self.index_struct.read().clone())
    }

    fn storage_context(&self) -> &StorageContext {
        &self.storage
    }

    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn as_retriever(&self, options: &RetrieverOptions) -> Result<Arc<dyn Retriever>> {
        Ok(Arc::new(self.retriever(options)?))
    }

    async fn insert_nodes(&self, nodes: Vec<Node>) -> Result<()> {
        self.add_nodes(nodes).await?;
        self.persist_struct()
    }

    async fn delete_nodes(&self, node_ids: &[String], delete_from_docstore: bool) -> Result<()> {
        self.vector_store()?.delete_nodes(node_ids).await?;
        {
            let mut index_struct = self.index_struct.write();
            for id in node_ids {
                index_struct.delete(id);
            }
        }
        if delete_from_docstore {
            for id in node_ids {
                self.storage.docstore().delete_document(id, false)?;
            }
        }
        self.persist_struct()
    }

    async fn delete_ref_doc(&self, ref_doc_id: &str, delete_from_docstore: bool) -> Result<()> {
        let docstore = self.storage.docstore();
        let node_ids =
            docstore.get_ref_doc_info(ref_doc_id)?.map(|info| info.node_ids).unwrap_or_default();
        self.vector_store()?.delete(ref_doc_id).await?;
        {
            let mut index_struct = self.index_struct.write();
            for id in &node_ids {
                index_struct.delete(id);
            }
        }
        if delete_from_docstore {
            docstore.delete_ref_doc(ref_doc_id, false)?;
        }
        self.persist_struct()
    }
}
