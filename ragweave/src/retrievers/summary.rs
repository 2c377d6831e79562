use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::data_structs::IndexList;
use crate::error::Result;
use crate::models::{EmbeddingModel, Llm, top_k_by_similarity};
use crate::prompts::{CHOICE_SELECT_PROMPT, PromptTemplate};
use crate::schema::{MetadataMode, Node, NodeWithScore, QueryBundle};
use crate::storage::DocStore;

use super::{Retriever, query_embedding};

/// How a [`SummaryRetriever`] narrows the node list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryRetrieverMode {
    /// Every node, score 1.
    #[default]
    Default,
    /// Top-k by cosine similarity to the query embedding.
    Embedding,
    /// Nodes an LLM judges relevant, scored by its relevance grade.
    Llm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRetrieverConfig {
    pub mode: SummaryRetrieverMode,
    /// Embedding mode only.
    pub similarity_top_k: usize,
    /// Documents shown to the LLM per prompt.
    pub choice_batch_size: usize,
}

impl Default for SummaryRetrieverConfig {
    fn default() -> Self {
        Self { mode: SummaryRetrieverMode::Default, similarity_top_k: 1, choice_batch_size: 10 }
    }
}

/// Retriever over a summary index.
pub struct SummaryRetriever {
    index_struct: Arc<RwLock<IndexList>>,
    docstore: Arc<DocStore>,
    embed_model: Arc<dyn EmbeddingModel>,
    llm: Option<Arc<dyn Llm>>,
    config: SummaryRetrieverConfig,
    choice_template: PromptTemplate,
}

impl SummaryRetriever {
    pub fn new(
        index_struct: Arc<RwLock<IndexList>>,
        docstore: Arc<DocStore>,
        embed_model: Arc<dyn EmbeddingModel>,
        llm: Option<Arc<dyn Llm>>,
        config: SummaryRetrieverConfig,
    ) -> Self {
        Self {
            index_struct,
            docstore,
            embed_model,
            llm,
            config,
            choice_template: PromptTemplate::new(CHOICE_SELECT_PROMPT),
        }
    }

    pub fn with_choice_template(mut self, template: PromptTemplate) -> Self {
        self.choice_template = template;
        self
    }

    fn nodes(&self) -> Result<Vec<Node>> {
        let ids = self.index_struct.read().nodes.clone();
        self.docstore.get_nodes(&ids)
    }

    async fn by_embedding(
        &self,
        query: &QueryBundle,
        nodes: Vec<Node>,
    ) -> Result<Vec<NodeWithScore>> {
        let query_vec = query_embedding(&self.embed_model, query).await?;
        let mut embeddings = Vec::with_capacity(nodes.len());
        for node in &nodes {
            match &node.embedding {
                Some(embedding) => embeddings.push(embedding.clone()),
                None => embeddings.push(
                    self.embed_model.text_embedding(&node.content(MetadataMode::Embed)).await?,
                ),
            }
        }
        let ranked = top_k_by_similarity(
            &query_vec,
            embeddings.iter().map(Vec::as_slice),
            self.config.similarity_top_k,
        )?;
        Ok(ranked
            .into_iter()
            .map(|(i, score)| NodeWithScore::new(nodes[i].clone(), score))
            .collect())
    }

    async fn by_llm(
        &self,
        llm: &dyn Llm,
        query: &QueryBundle,
        nodes: Vec<Node>,
    ) -> Result<Vec<NodeWithScore>> {
        let mut picked: Vec<NodeWithScore> = Vec::new();
        for batch in nodes.chunks(self.config.choice_batch_size.max(1)) {
            let context = batch
                .iter()
                .enumerate()
                .map(|(i, node)| {
                    format!("Document {}:\n{}", i + 1, node.content(MetadataMode::Llm))
                })
                .collect::<Vec<_>>()
                .join("\n\n");
            let prompt = self
                .choice_template
                .format(&[("context_str", &context), ("query_str", &query.query_str)]);
            let answer = llm.complete(&prompt).await?;
            for (number, relevance) in parse_choice_select_answer(&answer) {
                match number.checked_sub(1).and_then(|i| batch.get(i)) {
                    Some(node) => picked.push(NodeWithScore::new(node.clone(), relevance)),
                    None => debug!(number, "choice outside the presented batch"),
                }
            }
        }
        // stable: equal grades keep document order
        picked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(picked)
    }
}

#[async_trait]
impl Retriever for SummaryRetriever {
    async fn retrieve(&self, query: &QueryBundle) -> Result<Vec<NodeWithScore>> {
        let nodes = self.nodes()?;
        let hits = match (self.config.mode, &self.llm) {
            (SummaryRetrieverMode::Embedding, _) => self.by_embedding(query, nodes).await?,
            (SummaryRetrieverMode::Llm, Some(llm)) => {
                self.by_llm(llm.as_ref(), query, nodes).await?
            }
            (SummaryRetrieverMode::Llm, None) => {
                warn!("no LLM configured for summary retrieval, returning every node");
                nodes.into_iter().map(|n| NodeWithScore::new(n, 1.0)).collect()
            }
            (SummaryRetrieverMode::Default, _) => {
                nodes.into_iter().map(|n| NodeWithScore::new(n, 1.0)).collect()
            }
        };
        debug!(mode = ?self.config.mode, hits = hits.len(), "summary retrieval");
        Ok(hits)
    }
}

static CHOICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)doc(?:ument)?\s*:?\s*(\d+)\s*,\s*relevance\s*:?\s*(\d+(?:\.\d+)?)")
        .expect("static regex")
});

/// `(document number, relevance)` pairs from a `Doc: N, Relevance: R` answer.
fn parse_choice_select_answer(answer: &str) -> Vec<(usize, f32)> {
    CHOICE_RE
        .captures_iter(answer)
        .filter_map(|c| Some((c[1].parse().ok()?, c[2].parse().ok()?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MockEmbedding, MockLlm};

    fn setup() -> (Arc<RwLock<IndexList>>, Arc<DocStore>) {
        let docstore = Arc::new(DocStore::in_memory());
        let nodes = vec![
            Node::with_id("a", "apples and pears"),
            Node::with_id("b", "rust borrow checker"),
            Node::with_id("c", "pears in syrup"),
        ];
        docstore.add_documents(&nodes, true).unwrap();
        let mut list = IndexList::new("s");
        for node in &nodes {
            list.add_node(&node.id);
        }
        (Arc::new(RwLock::new(list)), docstore)
    }

    #[test]
    fn parses_choice_lines() {
        let parsed = parse_choice_select_answer("Doc: 2, Relevance: 7\nDoc: 1, Relevance: 3.5");
        assert_eq!(parsed, vec![(2, 7.0), (1, 3.5)]);
    }

    #[tokio::test]
    async fn embedding_mode_ranks_by_similarity() {
        let (list, docstore) = setup();
        let config = SummaryRetrieverConfig {
            mode: SummaryRetrieverMode::Embedding,
            ..SummaryRetrieverConfig::default()
        };
        let retriever =
            SummaryRetriever::new(list, docstore, Arc::new(MockEmbedding::new(256)), None, config);
        let hits = retriever.retrieve_str("borrow checker").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id(), "b");
    }

    #[tokio::test]
    async fn llm_mode_keeps_graded_documents() {
        let (list, docstore) = setup();
        let llm = Arc::new(MockLlm::fixed("Doc: 3, Relevance: 6\nDoc: 1, Relevance: 9"));
        let config = SummaryRetrieverConfig {
            mode: SummaryRetrieverMode::Llm,
            ..SummaryRetrieverConfig::default()
        };
        let retriever = SummaryRetriever::new(
            list,
            docstore,
            Arc::new(MockEmbedding::default()),
            Some(llm.clone()),
            config,
        );
        let hits = retriever.retrieve_str("pears").await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(hits[0].score, 9.0);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn llm_mode_without_llm_returns_everything() {
        let (list, docstore) = setup();
        let config = SummaryRetrieverConfig {
            mode: SummaryRetrieverMode::Llm,
            ..SummaryRetrieverConfig::default()
        };
        let retriever =
            SummaryRetriever::new(list, docstore, Arc::new(MockEmbedding::default()), None, config);
        assert_eq!(retriever.retrieve_str("q").await.unwrap().len(), 3);
    }
}
