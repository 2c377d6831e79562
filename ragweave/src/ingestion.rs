//! Ingestion pipeline: parse, deduplicate, embed, store.
//!
//! # Example
//!
//! ```rust,ignore
//! use ragweave::ingestion::IngestionPipeline;
//! use ragweave::node_parser::{SentenceSplitter, SplitterConfig};
//!
//! let pipeline = IngestionPipeline::builder()
//!     .parser(Arc::new(SentenceSplitter::new(SplitterConfig::default())))
//!     .embed_model(Arc::new(my_embedder))
//!     .docstore(storage.docstore().clone())
//!     .vector_store(storage.vector_store())
//!     .build()?;
//!
//! let nodes = pipeline.run(&documents).await?;
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{RagError, Result};
use crate::models::{EmbeddingModel, embed_nodes};
use crate::node_parser::NodeParser;
use crate::schema::{Document, Node};
use crate::storage::{DocStore, VectorStore};

pub const DEFAULT_EMBED_BATCH_SIZE: usize = 10;

/// How documents already seen by the docstore are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocstoreStrategy {
    /// Skip unchanged documents; re-ingest changed ones after deleting their old nodes.
    #[default]
    Upserts,
    /// Skip documents whose content hash is already stored under any id.
    DuplicatesOnly,
}

/// Turns documents into stored, embedded nodes.
pub struct IngestionPipeline {
    parser: Arc<dyn NodeParser>,
    embed_model: Option<Arc<dyn EmbeddingModel>>,
    docstore: Option<Arc<DocStore>>,
    vector_store: Option<Arc<dyn VectorStore>>,
    strategy: DocstoreStrategy,
    embed_batch_size: usize,
}

impl IngestionPipeline {
    pub fn builder() -> IngestionPipelineBuilder {
        IngestionPipelineBuilder::default()
    }

    pub fn strategy(&self) -> DocstoreStrategy {
        self.strategy
    }

    /// Documents that still need ingesting, and the ids of changed ones whose old
    /// nodes must go once the new ones are ready.
    fn pending<'a>(&self, documents: &'a [Document]) -> Result<(Vec<&'a Document>, Vec<String>)> {
        let Some(docstore) = &self.docstore else {
            return Ok((documents.iter().collect(), Vec::new()));
        };
        let mut pending = Vec::with_capacity(documents.len());
        let mut stale = Vec::new();
        match self.strategy {
            DocstoreStrategy::DuplicatesOnly => {
                let mut seen: BTreeSet<String> =
                    docstore.get_all_document_hashes()?.into_keys().collect();
                for document in documents {
                    if seen.insert(document.hash()) {
                        pending.push(document);
                    } else {
                        debug!(document.id = %document.id, "skipping duplicate document");
                    }
                }
            }
            DocstoreStrategy::Upserts => {
                for document in documents {
                    match docstore.get_document_hash(&document.id)? {
                        Some(hash) if hash == document.hash() => {
                            debug!(document.id = %document.id, "skipping unchanged document");
                        }
                        Some(_) => {
                            stale.push(document.id.clone());
                            pending.push(document);
                        }
                        None => pending.push(document),
                    }
                }
            }
        }
        Ok((pending, stale))
    }

    /// Drop the old nodes of changed documents from both stores.
    async fn remove_stale(&self, stale: &[String]) -> Result<()> {
        for ref_doc_id in stale {
            if let Some(docstore) = &self.docstore {
                docstore.delete_ref_doc(ref_doc_id, false)?;
            }
            if let Some(vector_store) = &self.vector_store {
                vector_store.delete(ref_doc_id).await?;
            }
            debug!(document.id = %ref_doc_id, "removed stale nodes");
        }
        Ok(())
    }

    /// Ingest `documents` and return the nodes that were stored.
    ///
    /// # Errors
    ///
    /// Fails on the first embedding or storage error, naming the first
    /// document of the batch in the log. A changed document keeps its old nodes
    /// when embedding its new ones fails.
    pub async fn run(&self, documents: &[Document]) -> Result<Vec<Node>> {
        let (pending, stale) = self.pending(documents)?;
        if pending.is_empty() {
            info!(documents = documents.len(), node_count = 0, "ingestion skipped every document");
            return Ok(Vec::new());
        }
        let batch: Vec<Document> = pending.iter().map(|d| (*d).clone()).collect();
        let mut nodes = self.parser.get_nodes_from_documents(&batch);

        if let Some(embed_model) = &self.embed_model {
            embed_nodes(embed_model.as_ref(), &mut nodes, self.embed_batch_size)
                .await
                .inspect_err(|e| {
                    error!(document.id = %batch[0].id, error = %e, "embedding failed");
                })?;
        }
        self.remove_stale(&stale).await?;
        if let Some(vector_store) = &self.vector_store {
            vector_store.add(&nodes).await.inspect_err(|e| {
                error!(document.id = %batch[0].id, error = %e, "upsert failed during ingestion");
            })?;
        }
        if let Some(docstore) = &self.docstore {
            docstore.add_documents(&nodes, true)?;
            for document in &batch {
                docstore.set_document_hash(&document.id, &document.hash())?;
            }
        }

        info!(documents = batch.len(), node_count = nodes.len(), "ingested documents");
        Ok(nodes)
    }
}

/// Builder for an [`IngestionPipeline`]; only the parser is required.
#[derive(Default)]
pub struct IngestionPipelineBuilder {
    parser: Option<Arc<dyn NodeParser>>,
    embed_model: Option<Arc<dyn EmbeddingModel>>,
    docstore: Option<Arc<DocStore>>,
    vector_store: Option<Arc<dyn VectorStore>>,
    strategy: DocstoreStrategy,
    embed_batch_size: Option<usize>,
}

impl IngestionPipelineBuilder {
    pub fn parser(mut self, parser: Arc<dyn NodeParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn embed_model(mut self, model: Arc<dyn EmbeddingModel>) -> Self {
        self.embed_model = Some(model);
        self
    }

    pub fn docstore(mut self, docstore: Arc<DocStore>) -> Self {
        self.docstore = Some(docstore);
        self
    }

    pub fn vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    pub fn strategy(mut self, strategy: DocstoreStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn embed_batch_size(mut self, size: usize) -> Self {
        self.embed_batch_size = Some(size);
        self
    }

    /// # Errors
    ///
    /// Returns [`RagError::InvalidArgument`] if the parser is missing, the batch
    /// size is zero, or a vector store is set without an embedding model.
    pub fn build(self) -> Result<IngestionPipeline> {
        let parser =
            self.parser.ok_or_else(|| RagError::InvalidArgument("parser is required".into()))?;
        if self.vector_store.is_some() && self.embed_model.is_none() {
            return Err(RagError::InvalidArgument(
                "a vector store needs an embedding model".into(),
            ));
        }
        let embed_batch_size = self.embed_batch_size.unwrap_or(DEFAULT_EMBED_BATCH_SIZE);
        if embed_batch_size == 0 {
            return Err(RagError::InvalidArgument("embed_batch_size must be at least 1".into()));
        }
        Ok(IngestionPipeline {
            parser,
            embed_model: self.embed_model,
            docstore: self.docstore,
            vector_store: self.vector_store,
            strategy: self.strategy,
            embed_batch_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::models::MockEmbedding;
    use crate::node_parser::{SentenceSplitter, SplitterConfig};
    use crate::storage::{SimpleVectorStore, VectorStoreQuery};

    struct Fixture {
        docstore: Arc<DocStore>,
        vector_store: Arc<SimpleVectorStore>,
    }

    fn pipeline(strategy: DocstoreStrategy) -> (IngestionPipeline, Fixture) {
        let docstore = Arc::new(DocStore::in_memory());
        let vector_store = Arc::new(SimpleVectorStore::new());
        let pipeline = IngestionPipeline::builder()
            .parser(Arc::new(SentenceSplitter::new(SplitterConfig::default())))
            .embed_model(Arc::new(MockEmbedding::default()))
            .docstore(docstore.clone())
            .vector_store(vector_store.clone())
            .strategy(strategy)
            .build()
            .unwrap();
        (pipeline, Fixture { docstore, vector_store })
    }

    #[tokio::test]
    async fn upserts_skip_unchanged_and_replace_changed() {
        let (pipeline, fx) = pipeline(DocstoreStrategy::Upserts);
        let first = pipeline.run(&[Document::new("d1", "cats purr")]).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].embedding.is_some());

        assert!(pipeline.run(&[Document::new("d1", "cats purr")]).await.unwrap().is_empty());

        let changed = pipeline.run(&[Document::new("d1", "dogs bark")]).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(fx.docstore.get_node(&changed[0].id).unwrap().text, "dogs bark");
        let info = fx.docstore.get_ref_doc_info("d1").unwrap().unwrap();
        assert_eq!(info.node_ids, vec![changed[0].id.clone()]);

        let query = VectorStoreQuery::new(changed[0].embedding.clone().unwrap(), 10);
        let result = fx.vector_store.query(&query).await.unwrap();
        assert_eq!(result.ids, vec![changed[0].id.clone()]);
    }

    struct OfflineEmbedding;

    #[async_trait]
    impl EmbeddingModel for OfflineEmbedding {
        async fn text_embedding(&self, _text: &str) -> Result<Vec<f32>> {
            Err(RagError::upstream("offline-embed", "connection refused"))
        }

        fn dimensions(&self) -> usize {
            8
        }
    }

    #[tokio::test]
    async fn failed_embedding_keeps_previous_version() {
        let (pipeline, fx) = pipeline(DocstoreStrategy::Upserts);
        let first = pipeline.run(&[Document::new("d1", "cats purr")]).await.unwrap();
        let old_hash = fx.docstore.get_document_hash("d1").unwrap();

        let offline = IngestionPipeline::builder()
            .parser(Arc::new(SentenceSplitter::new(SplitterConfig::default())))
            .embed_model(Arc::new(OfflineEmbedding))
            .docstore(fx.docstore.clone())
            .vector_store(fx.vector_store.clone())
            .build()
            .unwrap();
        let err = offline.run(&[Document::new("d1", "dogs bark")]).await.unwrap_err();
        assert!(matches!(err, RagError::Upstream { .. }));

        assert_eq!(fx.docstore.get_node(&first[0].id).unwrap().text, "cats purr");
        assert_eq!(fx.docstore.get_document_hash("d1").unwrap(), old_hash);
        let info = fx.docstore.get_ref_doc_info("d1").unwrap().unwrap();
        assert_eq!(info.node_ids, vec![first[0].id.clone()]);
        let query = VectorStoreQuery::new(first[0].embedding.clone().unwrap(), 10);
        let result = fx.vector_store.query(&query).await.unwrap();
        assert_eq!(result.ids, vec![first[0].id.clone()]);
    }

    #[tokio::test]
    async fn duplicates_only_matches_hash_across_ids() {
        let (pipeline, _fx) = pipeline(DocstoreStrategy::DuplicatesOnly);
        let nodes = pipeline
            .run(&[Document::new("a", "same text"), Document::new("b", "same text")])
            .await
            .unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(pipeline.run(&[Document::new("c", "same text")]).await.unwrap().is_empty());
    }

    #[test]
    fn build_validates() {
        assert!(IngestionPipeline::builder().build().is_err());
        let err = IngestionPipeline::builder()
            .parser(Arc::new(SentenceSplitter::new(SplitterConfig::default())))
            .vector_store(Arc::new(SimpleVectorStore::new()))
            .build();
        assert!(err.is_err());
    }
}
