use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::data_structs::KgIndexStruct;
use crate::error::Result;
use crate::indices::{KeywordExtractor, parse_triplets};
use crate::models::{EmbeddingModel, Llm, top_k_by_similarity};
use crate::schema::{Node, NodeWithScore, QueryBundle};
use crate::storage::{DEFAULT_REL_MAP_LIMIT, DocStore, GraphStore};

use super::{Retriever, query_embedding};

/// Chunks kept per matched keyword.
pub const GLOBAL_EXPLORE_NODE_LIMIT: usize = 3;

/// Metadata key holding the knowledge sequences of the synthesized node.
pub const KG_REL_TEXTS_KEY: &str = "kg_rel_texts";

const KG_CONTEXT_HEADER: &str = "The following are knowledge sequences in max depth {depth} \
in the form of a directed graph like:\n`subject -[predicate]-> object <-[predicate_next_hop]- \
object_next_hop ...`";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KgRetrieverMode {
    /// Query keywords to entities, then graph walks.
    #[default]
    Keyword,
    /// Triplets ranked by embedding similarity.
    Embedding,
    /// Both, merged.
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KgRetrieverConfig {
    pub mode: KgRetrieverMode,
    pub extractor: KeywordExtractor,
    pub max_keywords_per_query: usize,
    pub num_chunks_per_query: usize,
    /// Return source chunks along with the knowledge sequences.
    pub include_text: bool,
    /// Triplets taken in embedding mode.
    pub similarity_top_k: usize,
    pub graph_store_query_depth: usize,
    pub rel_map_limit: usize,
    /// Cap on knowledge sequences in hybrid mode.
    pub max_knowledge_sequence: usize,
}

impl Default for KgRetrieverConfig {
    fn default() -> Self {
        Self {
            mode: KgRetrieverMode::Keyword,
            extractor: KeywordExtractor::Simple,
            max_keywords_per_query: 10,
            num_chunks_per_query: 10,
            include_text: true,
            similarity_top_k: 2,
            graph_store_query_depth: 2,
            rel_map_limit: DEFAULT_REL_MAP_LIMIT,
            max_knowledge_sequence: 30,
        }
    }
}

/// Retriever over a knowledge-graph index.
///
/// Returns the matching source chunks, followed by one synthesized node whose
/// text lists the knowledge sequences found.
pub struct KnowledgeGraphRetriever {
    index_struct: Arc<RwLock<KgIndexStruct>>,
    docstore: Arc<DocStore>,
    graph_store: Arc<dyn GraphStore>,
    llm: Arc<dyn Llm>,
    embed_model: Arc<dyn EmbeddingModel>,
    config: KgRetrieverConfig,
}

impl KnowledgeGraphRetriever {
    pub fn new(
        index_struct: Arc<RwLock<KgIndexStruct>>,
        docstore: Arc<DocStore>,
        graph_store: Arc<dyn GraphStore>,
        llm: Arc<dyn Llm>,
        embed_model: Arc<dyn EmbeddingModel>,
        config: KgRetrieverConfig,
    ) -> Self {
        Self { index_struct, docstore, graph_store, llm, embed_model, config }
    }

    /// Chunk ids with match counts, and rel texts from walks starting at matched entities.
    async fn keyword_search(
        &self,
        query: &QueryBundle,
    ) -> Result<(Vec<(String, usize)>, Vec<String>)> {
        let keywords = self
            .config
            .extractor
            .query_keywords(self.llm.as_ref(), &query.query_str, self.config.max_keywords_per_query)
            .await?;

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut entities: Vec<String> = Vec::new();
        {
            let index_struct = self.index_struct.read();
            for keyword in &keywords {
                // entities keep their extracted casing; match them case-insensitively
                for (entity, ids) in &index_struct.table {
                    if entity.to_lowercase() != *keyword {
                        continue;
                    }
                    if !entities.contains(entity) {
                        entities.push(entity.clone());
                    }
                    for id in ids.iter().take(GLOBAL_EXPLORE_NODE_LIMIT) {
                        *counts.entry(id.clone()).or_default() += 1;
                    }
                }
            }
        }

        let rel_map = self
            .graph_store
            .get_rel_map(&entities, self.config.graph_store_query_depth, self.config.rel_map_limit)
            .await?;
        let rel_texts: Vec<String> =
            rel_map.values().flatten().map(ToString::to_string).collect();
        debug!(?keywords, ?entities, rel_texts = rel_texts.len(), "kg keyword search");

        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(self.config.num_chunks_per_query);
        Ok((ranked, rel_texts))
    }

    /// Closest triplets, rendered as one-hop sequences like the keyword walks.
    async fn embedding_search(&self, query: &QueryBundle) -> Result<Vec<String>> {
        let query_vec = query_embedding(&self.embed_model, query).await?;
        let (texts, embeddings): (Vec<String>, Vec<Vec<f32>>) =
            self.index_struct.read().embedding_dict.clone().into_iter().unzip();
        let ranked = top_k_by_similarity(
            &query_vec,
            embeddings.iter().map(Vec::as_slice),
            self.config.similarity_top_k,
        )?;
        let rel_texts: Vec<String> =
            ranked.into_iter().map(|(i, _)| as_rel_text(&texts[i])).collect();
        debug!(rel_texts = ?rel_texts, "kg embedding search");
        Ok(rel_texts)
    }

    fn context_node(&self, rel_texts: &[String]) -> Node {
        let header =
            KG_CONTEXT_HEADER.replace("{depth}", &self.config.graph_store_query_depth.to_string());
        let text = format!("{header}\n{}", rel_texts.join("\n"));
        let mut node = Node::with_id(uuid::Uuid::new_v4().to_string(), text).with_metadata(
            KG_REL_TEXTS_KEY,
            Value::Array(rel_texts.iter().cloned().map(Value::String).collect()),
        );
        node.excluded_embed_metadata_keys.push(KG_REL_TEXTS_KEY.to_string());
        node.excluded_llm_metadata_keys.push(KG_REL_TEXTS_KEY.to_string());
        node
    }
}

/// `(s, p, o)` as `s -[p]-> o`; anything else is returned unchanged.
fn as_rel_text(triplet_text: &str) -> String {
    match parse_triplets(triplet_text, 1, usize::MAX).first() {
        Some(triplet) => triplet.rel_text(),
        None => triplet_text.to_string(),
    }
}

/// Deduplicate, drop any sequence contained in a longer kept one, cap at `max`.
fn merge_rel_texts(texts: Vec<String>, max: usize) -> Vec<String> {
    let mut unique: Vec<String> = Vec::new();
    for text in texts {
        if !unique.contains(&text) {
            unique.push(text);
        }
    }
    let mut by_length: Vec<&String> = unique.iter().collect();
    by_length.sort_by(|a, b| b.len().cmp(&a.len()));
    let mut kept: Vec<&String> = Vec::new();
    for text in by_length {
        if !kept.iter().any(|k| k.contains(text.as_str())) {
            kept.push(text);
        }
    }
    // restore first-seen order
    unique.iter().filter(|t| kept.contains(t)).take(max).cloned().collect()
}

#[async_trait]
impl Retriever for KnowledgeGraphRetriever {
    async fn retrieve(&self, query: &QueryBundle) -> Result<Vec<NodeWithScore>> {
        let (chunks, rel_texts) = match self.config.mode {
            KgRetrieverMode::Keyword => self.keyword_search(query).await?,
            KgRetrieverMode::Embedding => (Vec::new(), self.embedding_search(query).await?),
            KgRetrieverMode::Hybrid => {
                let (chunks, mut texts) = self.keyword_search(query).await?;
                texts.extend(self.embedding_search(query).await?);
                (chunks, merge_rel_texts(texts, self.config.max_knowledge_sequence))
            }
        };

        let mut hits = Vec::new();
        if self.config.include_text && !chunks.is_empty() {
            let top = chunks.first().map_or(1, |(_, count)| *count).max(1) as f32;
            for (id, count) in chunks {
                hits.push(NodeWithScore::new(self.docstore.get_node(&id)?, count as f32 / top));
            }
        }
        if !rel_texts.is_empty() {
            hits.push(NodeWithScore::new(self.context_node(&rel_texts), 1.0));
        }
        debug!(mode = ?self.config.mode, hits = hits.len(), "kg retrieval");
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MockEmbedding, MockLlm};
    use crate::storage::{SimpleGraphStore, Triplet};

    async fn retriever(mode: KgRetrieverMode) -> KnowledgeGraphRetriever {
        let docstore = Arc::new(DocStore::in_memory());
        docstore
            .add_documents(&[Node::with_id("n1", "Alice is Bob's mother. Bob likes chess.")], true)
            .unwrap();
        let graph = Arc::new(SimpleGraphStore::new());
        let embed = Arc::new(MockEmbedding::new(256));
        let mut kg = KgIndexStruct::new("kg");
        let triplets =
            [Triplet::new("Alice", "is mother of", "Bob"), Triplet::new("Bob", "likes", "chess")];
        for triplet in triplets {
            graph.upsert_triplet(&triplet).await.unwrap();
            kg.add_node([triplet.subject.as_str(), triplet.object.as_str()], "n1");
            let text = triplet.to_string();
            kg.add_to_embedding_dict(text.clone(), embed.text_embedding(&text).await.unwrap());
        }
        let config =
            KgRetrieverConfig { mode, similarity_top_k: 1, ..KgRetrieverConfig::default() };
        KnowledgeGraphRetriever::new(
            Arc::new(RwLock::new(kg)),
            docstore,
            graph,
            Arc::new(MockLlm::default()),
            embed,
            config,
        )
    }

    fn rel_texts(hit: &NodeWithScore) -> Vec<String> {
        serde_json::from_value(hit.node.metadata[KG_REL_TEXTS_KEY].clone()).unwrap()
    }

    #[tokio::test]
    async fn keyword_mode_walks_from_matched_entities() {
        let kg = retriever(KgRetrieverMode::Keyword).await;
        let hits = kg.retrieve_str("who is alice?").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id(), "n1");
        let texts = rel_texts(&hits[1]);
        assert!(texts.contains(&"Alice -[is mother of]-> Bob".to_string()));
        assert!(texts.contains(&"Alice -[is mother of]-> Bob -[likes]-> chess".to_string()));
        assert!(!hits[1].node.content(crate::schema::MetadataMode::Llm).contains("kg_rel_texts"));
    }

    #[tokio::test]
    async fn embedding_mode_returns_closest_triplet() {
        let kg = retriever(KgRetrieverMode::Embedding).await;
        let hits = kg.retrieve_str("likes chess").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(rel_texts(&hits[0]), vec!["Bob -[likes]-> chess"]);
    }

    #[tokio::test]
    async fn hybrid_mode_merges_both_searches_without_duplicates() {
        let kg = retriever(KgRetrieverMode::Hybrid).await;
        let hits = kg.retrieve_str("who is alice?").await.unwrap();
        let texts = rel_texts(hits.last().unwrap());
        assert!(!texts.is_empty());
        for (i, text) in texts.iter().enumerate() {
            assert!(!text.starts_with('('), "unrendered triplet {text}");
            for (j, other) in texts.iter().enumerate() {
                assert!(i == j || !other.contains(text.as_str()), "{text} repeated in {other}");
            }
        }
        assert!(texts.contains(&"Alice -[is mother of]-> Bob -[likes]-> chess".to_string()));
    }

    #[test]
    fn merge_drops_contained_sequences() {
        let merged = merge_rel_texts(
            vec![
                "a -[p]-> b".into(),
                "a -[p]-> b -[q]-> c".into(),
                "a -[p]-> b".into(),
                "x".into(),
            ],
            10,
        );
        assert_eq!(merged, vec!["a -[p]-> b -[q]-> c", "x"]);
        assert_eq!(merge_rel_texts(vec!["a".into(), "b".into()], 1), vec!["a"]);
    }
}
