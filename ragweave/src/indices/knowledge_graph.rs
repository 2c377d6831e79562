//! Knowledge-graph index: LLM-extracted triplets in a graph store, keyed back to
//! the chunks they came from.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::data_structs::{IndexStruct, KgIndexStruct};
use crate::error::{RagError, Result};
use crate::prompts::{KG_TRIPLET_EXTRACT_PROMPT, PromptTemplate};
use crate::retrievers::{
    KgRetrieverConfig, KgRetrieverMode, KnowledgeGraphRetriever, Retriever, RetrieverOptions,
};
use crate::schema::{Document, MetadataMode, Node};
use crate::settings::Settings;
use crate::storage::{StorageContext, Triplet};

use super::{Index, new_index_id, parse_documents};

/// Knowledge-graph index parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeGraphConfig {
    pub max_triplets_per_chunk: usize,
    /// Embed each triplet's text for embedding-mode retrieval.
    pub include_embeddings: bool,
    /// Longest accepted subject, predicate or object, in characters.
    pub max_object_length: usize,
}

impl Default for KnowledgeGraphConfig {
    fn default() -> Self {
        Self { max_triplets_per_chunk: 10, include_embeddings: false, max_object_length: 128 }
    }
}

static TRIPLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^()]*)\)").expect("static regex"));

/// Triplets written as `(subject, predicate, object)` in `response`.
///
/// Anything that is not exactly three non-empty parts of at most
/// `max_length` characters is skipped. Duplicates are dropped.
pub fn parse_triplets(response: &str, max_triplets: usize, max_length: usize) -> Vec<Triplet> {
    let mut out: Vec<Triplet> = Vec::new();
    for capture in TRIPLET_RE.captures_iter(response) {
        if out.len() >= max_triplets {
            break;
        }
        let parts: Vec<&str> = capture[1]
            .split(',')
            .map(|p| p.trim().trim_matches(['"', '\'']))
            .map(str::trim)
            .collect();
        let [subject, predicate, object] = parts[..] else {
            continue;
        };
        let valid = |p: &str| !p.is_empty() && p.chars().count() <= max_length;
        if !(valid(subject) && valid(predicate) && valid(object)) {
            continue;
        }
        let triplet = Triplet::new(subject, predicate, object);
        if !out.contains(&triplet) {
            out.push(triplet);
        }
    }
    out
}

/// Triplets in a graph store plus a keyword table from entities to chunks.
///
/// Deleting nodes is not supported; rebuild the index instead.
pub struct KnowledgeGraphIndex {
    index_struct: Arc<RwLock<KgIndexStruct>>,
    storage: StorageContext,
    settings: Settings,
    config: KnowledgeGraphConfig,
    extract_template: PromptTemplate,
}

impl KnowledgeGraphIndex {
    pub async fn from_nodes(
        nodes: Vec<Node>,
        storage: StorageContext,
        settings: Settings,
        config: KnowledgeGraphConfig,
    ) -> Result<Self> {
        let index =
            Self::from_struct(KgIndexStruct::new(new_index_id()), storage, settings, config);
        index.add_nodes(&nodes).await?;
        info!(
            index_id = %index.index_id(),
            entities = index.index_struct.read().table.len(),
            "built knowledge graph index"
        );
        Ok(index)
    }

    pub async fn from_documents(
        documents: &[Document],
        storage: StorageContext,
        settings: Settings,
        config: KnowledgeGraphConfig,
    ) -> Result<Self> {
        let nodes = parse_documents(documents, &settings, &storage)?;
        Self::from_nodes(nodes, storage, settings, config).await
    }

    pub fn from_struct(
        index_struct: KgIndexStruct,
        storage: StorageContext,
        settings: Settings,
        config: KnowledgeGraphConfig,
    ) -> Self {
        Self {
            index_struct: Arc::new(RwLock::new(index_struct)),
            storage,
            settings,
            config,
            extract_template: PromptTemplate::new(KG_TRIPLET_EXTRACT_PROMPT),
        }
    }

    pub fn with_extract_template(mut self, template: PromptTemplate) -> Self {
        self.extract_template = template;
        self
    }

    /// A retriever with an explicit configuration.
    pub fn retriever(&self, config: KgRetrieverConfig) -> KnowledgeGraphRetriever {
        KnowledgeGraphRetriever::new(
            self.index_struct.clone(),
            self.storage.docstore().clone(),
            self.storage.graph_store().clone(),
            self.settings.llm.clone(),
            self.settings.embed_model.clone(),
            config,
        )
    }

    /// Ask the LLM for the triplets in `text`.
    pub async fn extract_triplets(&self, text: &str) -> Result<Vec<Triplet>> {
        let max = self.config.max_triplets_per_chunk.to_string();
        let prompt =
            self.extract_template.format(&[("max_knowledge_triplets", &max), ("text", text)]);
        let response = self.settings.llm.complete(&prompt).await?;
        Ok(parse_triplets(
            &response,
            self.config.max_triplets_per_chunk,
            self.config.max_object_length,
        ))
    }

    /// Add a triplet to the graph store, embedding its text if asked.
    pub async fn upsert_triplet(&self, triplet: &Triplet, include_embedding: bool) -> Result<()> {
        self.storage.graph_store().upsert_triplet(triplet).await?;
        self.index_struct.write().track_triplet(triplet);
        if include_embedding {
            let text = triplet.to_string();
            let embedding = self.settings.embed_model.text_embedding(&text).await?;
            self.index_struct.write().add_to_embedding_dict(text, embedding);
        }
        self.persist_struct()
    }

    /// Add a triplet and key both its entities to `node`.
    pub async fn upsert_triplet_and_node(
        &self,
        triplet: &Triplet,
        node: &Node,
        include_embedding: bool,
    ) -> Result<()> {
        self.storage.docstore().add_documents(std::slice::from_ref(node), true)?;
        {
            let mut index_struct = self.index_struct.write();
            index_struct.track_node(&node.id);
            index_struct.add_node([triplet.subject.as_str(), triplet.object.as_str()], &node.id);
        }
        self.upsert_triplet(triplet, include_embedding).await
    }

    /// Re-extract triplets from every chunk the index references.
    ///
    /// The triplets this index wrote are removed from the graph store first, and
    /// chunks no longer in the docstore are dropped.
    pub async fn rebuild(&self) -> Result<()> {
        let (index_id, node_ids, triplets) = {
            let index_struct = self.index_struct.read();
            (index_struct.index_id.clone(), index_struct.node_ids(), index_struct.triplets.clone())
        };
        let docstore = self.storage.docstore();
        let mut nodes = Vec::with_capacity(node_ids.len());
        for id in &node_ids {
            match docstore.get_document(id, false)? {
                Some(node) => nodes.push(node),
                None => debug!(node_id = %id, "dropping chunk missing from docstore"),
            }
        }
        let graph_store = self.storage.graph_store();
        for triplet in &triplets {
            graph_store.delete(triplet).await?;
        }
        debug!(index_id = %index_id, cleared = triplets.len(), "cleared graph before rebuild");
        *self.index_struct.write() = KgIndexStruct::new(index_id);
        self.add_nodes(&nodes).await
    }

    fn persist_struct(&self) -> Result<()> {
        self.storage.index_store().add_index_struct(&self.index_struct())
    }

    async fn add_nodes(&self, nodes: &[Node]) -> Result<()> {
        self.storage.docstore().add_documents(nodes, true)?;
        for node in nodes {
            let triplets = self.extract_triplets(&node.content(MetadataMode::Llm)).await?;
            debug!(node_id = %node.id, triplets = triplets.len(), "extracted triplets");
            self.index_struct.write().track_node(&node.id);
            for triplet in &triplets {
                self.storage.graph_store().upsert_triplet(triplet).await?;
                {
                    let mut index_struct = self.index_struct.write();
                    index_struct.track_triplet(triplet);
                    index_struct
                        .add_node([triplet.subject.as_str(), triplet.object.as_str()], &node.id);
                }
                if self.config.include_embeddings {
                    let text = triplet.to_string();
                    let embedding = self.settings.embed_model.text_embedding(&text).await?;
                    self.index_struct.write().add_to_embedding_dict(text, embedding);
                }
            }
        }
        self.persist_struct()
    }
}

#[async_trait]
impl Index for KnowledgeGraphIndex {
    fn index_id(&self) -> String {
        self.index_struct.read().index_id.clone()
    }

    fn index_struct(&self) -> IndexStruct {
        IndexStruct::Kg(self.index_struct.read().clone())
    }

    fn storage_context(&self) -> &StorageContext {
        &self.storage
    }

    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn as_retriever(&self, options: &RetrieverOptions) -> Result<Arc<dyn Retriever>> {
        let mode = match options.mode.as_deref() {
            None | Some("keyword") => KgRetrieverMode::Keyword,
            Some("embedding") => KgRetrieverMode::Embedding,
            Some("hybrid") => KgRetrieverMode::Hybrid,
            Some(other) => {
                return Err(RagError::InvalidArgument(format!(
                    "unknown knowledge graph retriever mode '{other}'"
                )));
            }
        };
        let mut config = KgRetrieverConfig { mode, ..KgRetrieverConfig::default() };
        if let Some(k) = options.similarity_top_k {
            config.similarity_top_k = k;
        }
        Ok(Arc::new(self.retriever(config)))
    }

    async fn insert_nodes(&self, nodes: Vec<Node>) -> Result<()> {
        self.add_nodes(&nodes).await
    }

    async fn delete_nodes(&self, _node_ids: &[String], _delete_from_docstore: bool) -> Result<()> {
        Err(RagError::Unsupported(
            "delete is not supported on knowledge graph indexes; use rebuild".into(),
        ))
    }
}
