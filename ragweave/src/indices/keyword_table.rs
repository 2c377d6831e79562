//! Keyword table index: keywords map to the nodes they were extracted from.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::data_structs::{IndexStruct, KeywordTable};
use crate::error::{RagError, Result};
use crate::keywords::{expand_with_subtokens, simple_extract_keywords};
use crate::models::Llm;
use crate::prompts::{
    KEYWORD_EXTRACT_PROMPT, PromptTemplate, QUERY_KEYWORD_EXTRACT_PROMPT,
    extract_keywords_given_response,
};
use crate::retrievers::{KeywordTableRetriever, Retriever, RetrieverOptions};
use crate::schema::{Document, MetadataMode, Node};
use crate::settings::Settings;
use crate::storage::StorageContext;

use super::{Index, new_index_id, parse_documents};

/// How keywords are pulled out of chunks and queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordExtractor {
    /// Frequency-ranked tokens, no model calls.
    #[default]
    Simple,
    /// Ask the LLM for a `KEYWORDS:` list.
    Llm,
}

impl KeywordExtractor {
    /// Keywords of a chunk.
    pub async fn chunk_keywords(
        self,
        llm: &dyn Llm,
        text: &str,
        max_keywords: usize,
    ) -> Result<Vec<String>> {
        self.extract(llm, KEYWORD_EXTRACT_PROMPT, "text", text, max_keywords).await
    }

    /// Keywords of a query.
    pub async fn query_keywords(
        self,
        llm: &dyn Llm,
        query: &str,
        max_keywords: usize,
    ) -> Result<Vec<String>> {
        self.extract(llm, QUERY_KEYWORD_EXTRACT_PROMPT, "question", query, max_keywords).await
    }

    async fn extract(
        self,
        llm: &dyn Llm,
        template: &str,
        slot: &str,
        text: &str,
        max_keywords: usize,
    ) -> Result<Vec<String>> {
        match self {
            Self::Simple => Ok(simple_extract_keywords(text, max_keywords)),
            Self::Llm => {
                let max = max_keywords.to_string();
                let prompt = PromptTemplate::new(template)
                    .format(&[("max_keywords", &max), (slot, text)]);
                let response = llm.complete(&prompt).await?;
                let keywords = extract_keywords_given_response(&response, "KEYWORDS:");
                Ok(expand_with_subtokens(&keywords))
            }
        }
    }
}

/// Keyword table parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordTableConfig {
    pub extractor: KeywordExtractor,
    pub max_keywords_per_chunk: usize,
    pub max_keywords_per_query: usize,
    /// Nodes returned per query.
    pub num_chunks_per_query: usize,
}

impl Default for KeywordTableConfig {
    fn default() -> Self {
        Self {
            extractor: KeywordExtractor::Simple,
            max_keywords_per_chunk: 10,
            max_keywords_per_query: 10,
            num_chunks_per_query: 10,
        }
    }
}

pub struct KeywordTableIndex {
    index_struct: Arc<RwLock<KeywordTable>>,
    storage: StorageContext,
    settings: Settings,
    config: KeywordTableConfig,
}

impl KeywordTableIndex {
    pub async fn from_nodes(
        nodes: Vec<Node>,
        storage: StorageContext,
        settings: Settings,
        config: KeywordTableConfig,
    ) -> Result<Self> {
        let index =
            Self::from_struct(KeywordTable::new(new_index_id()), storage, settings, config);
        index.add_nodes(&nodes).await?;
        info!(
            index_id = %index.index_id(),
            keywords = index.index_struct.read().table.len(),
            "built keyword table index"
        );
        Ok(index)
    }

    pub async fn from_documents(
        documents: &[Document],
        storage: StorageContext,
        settings: Settings,
        config: KeywordTableConfig,
    ) -> Result<Self> {
        let nodes = parse_documents(documents, &settings, &storage)?;
        Self::from_nodes(nodes, storage, settings, config).await
    }

    pub fn from_struct(
        index_struct: KeywordTable,
        storage: StorageContext,
        settings: Settings,
        config: KeywordTableConfig,
    ) -> Self {
        Self { index_struct: Arc::new(RwLock::new(index_struct)), storage, settings, config }
    }

    async fn add_nodes(&self, nodes: &[Node]) -> Result<()> {
        let mut extracted = Vec::with_capacity(nodes.len());
        for node in nodes {
            let keywords = self
                .config
                .extractor
                .chunk_keywords(
                    self.settings.llm.as_ref(),
                    &node.content(MetadataMode::Llm),
                    self.config.max_keywords_per_chunk,
                )
                .await?;
            debug!(node_id = %node.id, keywords = keywords.len(), "extracted keywords");
            extracted.push(keywords);
        }
        self.storage.docstore().add_documents(nodes, true)?;
        {
            let mut table = self.index_struct.write();
            for (node, keywords) in nodes.iter().zip(extracted) {
                table.add_node(keywords, &node.id);
            }
        }
        self.storage.index_store().add_index_struct(&self.index_struct())
    }
}

#[async_trait]
impl Index for KeywordTableIndex {
    fn index_id(&self) -> String {
        self.index_struct.read().index_id.clone()
    }

    fn index_struct(&self) -> IndexStruct {
        IndexStruct::KeywordTable(self.index_struct.read().clone())
    }

    fn storage_context(&self) -> &StorageContext {
        &self.storage
    }

    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn as_retriever(&self, options: &RetrieverOptions) -> Result<Arc<dyn Retriever>> {
        let extractor = match options.mode.as_deref() {
            None | Some("default") => self.config.extractor,
            Some("simple") => KeywordExtractor::Simple,
            Some("llm") => KeywordExtractor::Llm,
            Some(other) => {
                return Err(RagError::InvalidArgument(format!(
                    "unknown keyword table retriever mode '{other}'"
                )));
            }
        };
        Ok(Arc::new(KeywordTableRetriever::new(
            self.index_struct.clone(),
            self.storage.docstore().clone(),
            self.settings.llm.clone(),
            extractor,
            self.config.max_keywords_per_query,
            options.similarity_top_k.unwrap_or(self.config.num_chunks_per_query),
        )))
    }

    async fn insert_nodes(&self, nodes: Vec<Node>) -> Result<()> {
        self.add_nodes(&nodes).await
    }

    async fn delete_nodes(&self, node_ids: &[String], delete_from_docstore: bool) -> Result<()> {
        {
            let mut table = self.index_struct.write();
            for id in node_ids {
                table.delete_node(id);
            }
        }
        if delete_from_docstore {
            for id in node_ids {
                self.storage.docstore().delete_document(id, false)?;
            }
        }
        self.storage.index_store().add_index_struct(&self.index_struct())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MockLlm;

    #[tokio::test]
    async fn llm_extractor_parses_and_expands() {
        let llm = MockLlm::fixed("KEYWORDS: New York, pizza");
        let keywords =
            KeywordExtractor::Llm.query_keywords(&llm, "pizza in new york?", 5).await.unwrap();
        assert_eq!(keywords, vec!["new york", "new", "york", "pizza"]);
        assert!(llm.prompts()[0].contains("pizza in new york?"));
    }

    #[tokio::test]
    async fn table_maps_keywords_to_nodes() {
        let docs = vec![
            Document::new("d1", "Rust ownership rules"),
            Document::new("d2", "Ownership of land"),
        ];
        let index = KeywordTableIndex::from_documents(
            &docs,
            StorageContext::from_defaults(),
            Settings::default(),
            KeywordTableConfig::default(),
        )
        .await
        .unwrap();
        let IndexStruct::KeywordTable(table) = index.index_struct() else {
            panic!("wrong struct variant");
        };
        assert_eq!(table.table["ownership"].len(), 2);
        assert_eq!(table.table["rust"].len(), 1);

        index.delete_nodes(&["d1_0".to_string()], false).await.unwrap();
        let IndexStruct::KeywordTable(table) = index.index_struct() else {
            panic!("wrong struct variant");
        };
        assert!(!table.table.contains_key("rust"));
    }
}
