//! Summary (list) index: an ordered list of node ids.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use crate::data_structs::{IndexList, IndexStruct};
use crate::error::{RagError, Result};
use crate::retrievers::{
    Retriever, RetrieverOptions, SummaryRetriever, SummaryRetrieverConfig, SummaryRetrieverMode,
};
use crate::schema::{Document, Node};
use crate::settings::Settings;
use crate::storage::StorageContext;

use super::{Index, new_index_id, parse_documents};

/// Every node in insertion order. Retrieval returns all of them unless an
/// embedding or LLM mode narrows the list.
pub struct SummaryIndex {
    index_struct: Arc<RwLock<IndexList>>,
    storage: StorageContext,
    settings: Settings,
}

impl SummaryIndex {
    pub fn from_nodes(
        nodes: Vec<Node>,
        storage: StorageContext,
        settings: Settings,
    ) -> Result<Self> {
        let index = Self::from_struct(IndexList::new(new_index_id()), storage, settings);
        index.add_nodes(&nodes)?;
        info!(index_id = %index.index_id(), nodes = nodes.len(), "built summary index");
        Ok(index)
    }

    pub fn from_documents(
        documents: &[Document],
        storage: StorageContext,
        settings: Settings,
    ) -> Result<Self> {
        let nodes = parse_documents(documents, &settings, &storage)?;
        Self::from_nodes(nodes, storage, settings)
    }

    pub fn from_struct(
        index_struct: IndexList,
        storage: StorageContext,
        settings: Settings,
    ) -> Self {
        Self { index_struct: Arc::new(RwLock::new(index_struct)), storage, settings }
    }

    fn add_nodes(&self, nodes: &[Node]) -> Result<()> {
        self.storage.docstore().add_documents(nodes, true)?;
        {
            let mut index_struct = self.index_struct.write();
            for node in nodes {
                index_struct.add_node(&node.id);
            }
        }
        self.storage.index_store().add_index_struct(&self.index_struct())
    }

    /// A retriever with an explicit configuration.
    pub fn retriever(&self, config: SummaryRetrieverConfig) -> SummaryRetriever {
        SummaryRetriever::new(
            self.index_struct.clone(),
            self.storage.docstore().clone(),
            self.settings.embed_model.clone(),
            Some(self.settings.llm.clone()),
            config,
        )
    }
}

#[async_trait]
impl Index for SummaryIndex {
    fn index_id(&self) -> String {
        self.index_struct.read().index_id.clone()
    }

    fn index_struct(&self) -> IndexStruct {
        IndexStruct::List(self.index_struct.read().clone())
    }

    fn storage_context(&self) -> &StorageContext {
        &self.storage
    }

    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn as_retriever(&self, options: &RetrieverOptions) -> Result<Arc<dyn Retriever>> {
        let mode = match options.mode.as_deref() {
            None | Some("default") => SummaryRetrieverMode::Default,
            Some("embedding") => SummaryRetrieverMode::Embedding,
            Some("llm") => SummaryRetrieverMode::Llm,
            Some(other) => {
                return Err(RagError::InvalidArgument(format!(
                    "unknown summary retriever mode '{other}'"
                )));
            }
        };
        let mut config = SummaryRetrieverConfig { mode, ..SummaryRetrieverConfig::default() };
        if let Some(k) = options.similarity_top_k {
            config.similarity_top_k = k;
        }
        Ok(Arc::new(self.retriever(config)))
    }

    async fn insert_nodes(&self, nodes: Vec<Node>) -> Result<()> {
        self.add_nodes(&nodes)
    }

    async fn delete_nodes(&self, node_ids: &[String], delete_from_docstore: bool) -> Result<()> {
        self.index_struct.write().nodes.retain(|id| !node_ids.contains(id));
        if delete_from_docstore {
            for id in node_ids {
                self.storage.docstore().delete_document(id, false)?;
            }
        }
        self.storage.index_store().add_index_struct(&self.index_struct())
    }
}
