//! Index variants and the capability set they share.
//!
//! Every index keeps its [`IndexStruct`] in memory behind a lock shared with the
//! retrievers it hands out, and writes it back to the [`IndexStore`] after each
//! mutation. Node content always lives in the [`DocStore`].
//!
//! [`IndexStore`]: crate::storage::IndexStore
//! [`DocStore`]: crate::storage::DocStore

mod keyword_table;
mod knowledge_graph;
mod summary;
mod tree;
mod vector;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::data_structs::IndexStruct;
use crate::error::{RagError, Result};
use crate::node_parser::{NodeParser, SentenceSplitter};
use crate::query_engine::{CompactSynthesizer, RetrieverQueryEngine};
use crate::retrievers::{Retriever, RetrieverOptions};
use crate::schema::{Document, Node};
use crate::settings::Settings;
use crate::storage::StorageContext;

pub use keyword_table::{KeywordExtractor, KeywordTableConfig, KeywordTableIndex};
pub use knowledge_graph::{KnowledgeGraphConfig, KnowledgeGraphIndex, parse_triplets};
pub use summary::SummaryIndex;
pub use tree::{TreeIndex, TreeIndexConfig};
pub use vector::{VectorIndexConfig, VectorStoreIndex};

/// Capabilities shared by every index variant.
#[async_trait]
pub trait Index: Send + Sync {
    fn index_id(&self) -> String;

    /// Snapshot of the current struct.
    fn index_struct(&self) -> IndexStruct;

    fn storage_context(&self) -> &StorageContext;

    fn settings(&self) -> &Settings;

    /// A retriever over this index.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidArgument`] for a mode the index does not know.
    fn as_retriever(&self, options: &RetrieverOptions) -> Result<Arc<dyn Retriever>>;

    /// A query engine answering with the settings' LLM over [`as_retriever`](Index::as_retriever).
    fn as_query_engine(&self, options: &RetrieverOptions) -> Result<RetrieverQueryEngine> {
        let retriever = self.as_retriever(options)?;
        let synthesizer = CompactSynthesizer::new(self.settings().llm.clone());
        Ok(RetrieverQueryEngine::new(retriever, Arc::new(synthesizer)))
    }

    /// Add nodes to the docstore and the index struct.
    async fn insert_nodes(&self, nodes: Vec<Node>) -> Result<()>;

    /// Split a document with the settings' chunking and insert the pieces.
    async fn insert(&self, document: &Document) -> Result<()> {
        let nodes = SentenceSplitter::from_settings(self.settings())
            .get_nodes_from_documents(std::slice::from_ref(document));
        self.insert_nodes(nodes).await?;
        self.storage_context().docstore().set_document_hash(&document.id, &document.hash())
    }

    /// Remove nodes from the index, and from the docstore if asked.
    async fn delete_nodes(&self, node_ids: &[String], delete_from_docstore: bool) -> Result<()>;

    /// Remove every node derived from `ref_doc_id`.
    async fn delete_ref_doc(&self, ref_doc_id: &str, delete_from_docstore: bool) -> Result<()> {
        let docstore = self.storage_context().docstore();
        let Some(info) = docstore.get_ref_doc_info(ref_doc_id)? else {
            warn!(ref_doc_id, "ref doc not found, nothing to delete");
            return Ok(());
        };
        self.delete_nodes(&info.node_ids, false).await?;
        if delete_from_docstore {
            docstore.delete_ref_doc(ref_doc_id, false)?;
        }
        Ok(())
    }

    /// Insert new documents and re-insert changed ones. Returns, per document,
    /// whether it was (re)inserted.
    async fn refresh_documents(&self, documents: &[Document]) -> Result<Vec<bool>> {
        let mut refreshed = Vec::with_capacity(documents.len());
        for document in documents {
            let stored = self.storage_context().docstore().get_document_hash(&document.id)?;
            match stored {
                None => {
                    self.insert(document).await?;
                    refreshed.push(true);
                }
                Some(hash) if hash != document.hash() => {
                    self.delete_ref_doc(&document.id, true).await?;
                    self.insert(document).await?;
                    refreshed.push(true);
                }
                Some(_) => refreshed.push(false),
            }
        }
        debug!(
            refreshed = refreshed.iter().filter(|r| **r).count(),
            total = documents.len(),
            "refreshed documents"
        );
        Ok(refreshed)
    }
}

/// Split documents with the settings' chunking and record their hashes.
pub(crate) fn parse_documents(
    documents: &[Document],
    settings: &Settings,
    storage: &StorageContext,
) -> Result<Vec<Node>> {
    let nodes = SentenceSplitter::from_settings(settings).get_nodes_from_documents(documents);
    for document in documents {
        storage.docstore().set_document_hash(&document.id, &document.hash())?;
    }
    Ok(nodes)
}

/// Generated id for a new index.
pub(crate) fn new_index_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Build parameters applied to an index rehydrated by [`load_index_from_storage_with`].
///
/// Only the entry matching the stored variant is used.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexConfigs {
    pub vector: VectorIndexConfig,
    pub keyword_table: KeywordTableConfig,
    pub tree: TreeIndexConfig,
    pub knowledge_graph: KnowledgeGraphConfig,
}

/// Rehydrate an index from `storage` with default build parameters.
///
/// See [`load_index_from_storage_with`].
pub fn load_index_from_storage(
    storage: StorageContext,
    index_id: &str,
    settings: Settings,
) -> Result<Box<dyn Index>> {
    load_index_from_storage_with(storage, index_id, settings, IndexConfigs::default())
}

/// Rehydrate an index from `storage`, picking the variant from the persisted tag.
///
/// The index structs store no build parameters, so pass the ones the index was
/// built with to keep later inserts and rebuilds consistent. An empty
/// `index_id` loads the only stored index.
///
/// # Errors
///
/// - [`RagError::NotFound`] if no such index is stored.
/// - [`RagError::Ambiguous`] if `index_id` is empty and several are stored.
/// - [`RagError::InvalidArgument`] if the tree config is invalid.
pub fn load_index_from_storage_with(
    storage: StorageContext,
    index_id: &str,
    settings: Settings,
    configs: IndexConfigs,
) -> Result<Box<dyn Index>> {
    let index_struct = storage
        .index_store()
        .get_index_struct(index_id)?
        .ok_or_else(|| RagError::NotFound { kind: "index", id: index_id.to_string() })?;
    debug!(index_id = index_struct.index_id(), kind = index_struct.kind(), "loading index");
    Ok(match index_struct {
        IndexStruct::Vector(s) => {
            Box::new(VectorStoreIndex::from_struct(s, storage, settings, configs.vector))
        }
        IndexStruct::List(s) => Box::new(SummaryIndex::from_struct(s, storage, settings)),
        IndexStruct::KeywordTable(s) => {
            Box::new(KeywordTableIndex::from_struct(s, storage, settings, configs.keyword_table))
        }
        IndexStruct::Tree(s) => {
            configs.tree.validate()?;
            Box::new(TreeIndex::from_struct(s, storage, settings, configs.tree))
        }
        IndexStruct::Kg(s) => Box::new(KnowledgeGraphIndex::from_struct(
            s,
            storage,
            settings,
            configs.knowledge_graph,
        )),
    })
}
