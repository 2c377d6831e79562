//! # ragweave
//!
//! Retrieval-augmented generation core: storage, indexes, retrievers and the
//! compositors that fuse them.
//!
//! ## Overview
//!
//! Documents are split into [`Node`]s, persisted through a [`StorageContext`]
//! and organized by one of five index variants:
//!
//! - [`VectorStoreIndex`] - embeddings in a [`VectorStore`](storage::VectorStore)
//! - [`SummaryIndex`] - an ordered node list
//! - [`KeywordTableIndex`] - keyword to node table
//! - [`TreeIndex`] - LLM-summarized hierarchy
//! - [`KnowledgeGraphIndex`] - extracted triplets in a [`GraphStore`](storage::GraphStore)
//!
//! Each index hands out [`Retriever`]s. [`QueryFusionRetriever`](retrievers::QueryFusionRetriever),
//! [`RouterRetriever`](retrievers::RouterRetriever) and
//! [`AutoMergingRetriever`](retrievers::AutoMergingRetriever) compose them, and
//! [`Bm25Retriever`](retrievers::Bm25Retriever) adds lexical ranking.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ragweave::{Document, Index, Settings, StorageContext, VectorStoreIndex};
//! use ragweave::indices::VectorIndexConfig;
//! use ragweave::retrievers::RetrieverOptions;
//!
//! let documents = vec![Document::new("notes", "Cats purr when content.")];
//! let index = VectorStoreIndex::from_documents(
//!     &documents,
//!     StorageContext::from_defaults(),
//!     Settings::default(),
//!     VectorIndexConfig::default(),
//! )
//! .await?;
//!
//! let retriever = index.as_retriever(&RetrieverOptions::new().similarity_top_k(1))?;
//! let hits = retriever.retrieve_str("why do cats purr?").await?;
//! ```
//!
//! Models are consumed through the [`Llm`](models::Llm) and
//! [`EmbeddingModel`](models::EmbeddingModel) traits. The default [`Settings`]
//! use deterministic mocks so everything runs offline.

pub mod bm25;
pub mod cancel;
pub mod data_structs;
pub mod error;
pub mod indices;
pub mod ingestion;
pub mod keywords;
pub mod memory;
pub mod models;
pub mod node_parser;
pub mod postprocessor;
pub mod prompts;
pub mod query_engine;
pub mod retrievers;
pub mod schema;
pub mod selectors;
pub mod settings;
pub mod storage;
pub mod tools;

pub use cancel::{CancellationToken, cancellable};
pub use error::{RagError, Result};
pub use indices::{
    Index, KeywordTableIndex, KnowledgeGraphIndex, SummaryIndex, TreeIndex, VectorStoreIndex,
    load_index_from_storage, load_index_from_storage_with,
};
pub use query_engine::{QueryEngine, Response};
pub use retrievers::Retriever;
pub use schema::{Document, MetadataMode, Node, NodeWithScore, QueryBundle};
pub use settings::Settings;
pub use storage::StorageContext;
