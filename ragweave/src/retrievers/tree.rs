use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data_structs::IndexGraph;
use crate::error::{RagError, Result};
use crate::models::{EmbeddingModel, Llm, top_k_by_similarity};
use crate::prompts::{
    PromptTemplate, TREE_SELECT_MULTIPLE_PROMPT, TREE_SELECT_PROMPT, extract_numbers,
    numbered_list,
};
use crate::schema::{MetadataMode, NodeWithScore, QueryBundle};
use crate::storage::DocStore;

use super::{Retriever, query_embedding};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeRetrieverMode {
    /// Every leaf.
    AllLeaf,
    /// Only the root nodes.
    Root,
    /// Descend from the roots letting the LLM pick children.
    #[default]
    SelectLeaf,
    /// Descend from the roots by embedding similarity.
    SelectLeafEmbedding,
}

/// Retriever over a tree index.
pub struct TreeRetriever {
    index_struct: Arc<RwLock<IndexGraph>>,
    docstore: Arc<DocStore>,
    llm: Arc<dyn Llm>,
    embed_model: Arc<dyn EmbeddingModel>,
    mode: TreeRetrieverMode,
    branching_factor: usize,
    select_template: PromptTemplate,
    select_multiple_template: PromptTemplate,
}

impl TreeRetriever {
    pub fn new(
        index_struct: Arc<RwLock<IndexGraph>>,
        docstore: Arc<DocStore>,
        llm: Arc<dyn Llm>,
        embed_model: Arc<dyn EmbeddingModel>,
        mode: TreeRetrieverMode,
    ) -> Self {
        Self {
            index_struct,
            docstore,
            llm,
            embed_model,
            mode,
            branching_factor: 1,
            select_template: PromptTemplate::new(TREE_SELECT_PROMPT),
            select_multiple_template: PromptTemplate::new(TREE_SELECT_MULTIPLE_PROMPT),
        }
    }

    /// Children followed per level.
    pub fn with_branching_factor(mut self, branching_factor: usize) -> Self {
        self.branching_factor = branching_factor.max(1);
        self
    }

    fn all(&self, ids: Vec<String>) -> Result<Vec<NodeWithScore>> {
        let nodes = self.docstore.get_nodes(&ids)?;
        Ok(nodes.into_iter().map(|n| NodeWithScore::new(n, 1.0)).collect())
    }

    /// Pick up to `branching_factor` of `candidates`, with their scores.
    async fn pick(
        &self,
        query: &QueryBundle,
        query_vec: Option<&[f32]>,
        candidates: &[String],
    ) -> Result<Vec<(String, f32)>> {
        if candidates.len() <= self.branching_factor {
            return Ok(candidates.iter().map(|id| (id.clone(), 1.0)).collect());
        }
        let nodes = self.docstore.get_nodes(candidates)?;
        if let Some(query_vec) = query_vec {
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
                query_vec,
                embeddings.iter().map(Vec::as_slice),
                self.branching_factor,
            )?;
            return Ok(ranked.into_iter().map(|(i, s)| (candidates[i].clone(), s)).collect());
        }

        let texts: Vec<String> = nodes.iter().map(|n| n.content(MetadataMode::Llm)).collect();
        let num_chunks = candidates.len().to_string();
        let branching = self.branching_factor.to_string();
        let context_list = numbered_list(&texts);
        let vars = [
            ("num_chunks", num_chunks.as_str()),
            ("context_list", context_list.as_str()),
            ("query_str", query.query_str.as_str()),
            ("branching_factor", branching.as_str()),
        ];
        let prompt = if self.branching_factor == 1 {
            self.select_template.format(&vars)
        } else {
            self.select_multiple_template.format(&vars)
        };
        let answer = self.llm.complete(&prompt).await?;
        let mut picks: Vec<(String, f32)> = Vec::new();
        for number in extract_numbers(&answer, self.branching_factor) {
            if let Some(id) = number.checked_sub(1).and_then(|i| candidates.get(i)) {
                if !picks.iter().any(|(p, _)| p == id) {
                    picks.push((id.clone(), 1.0));
                }
            }
        }
        if picks.is_empty() {
            return Err(RagError::InvalidArgument(format!(
                "no valid choice among {} candidates in answer '{answer}'",
                candidates.len()
            )));
        }
        Ok(picks)
    }

    async fn select_leaves(&self, query: &QueryBundle) -> Result<Vec<NodeWithScore>> {
        let query_vec = match self.mode {
            TreeRetrieverMode::SelectLeafEmbedding => {
                Some(query_embedding(&self.embed_model, query).await?)
            }
            _ => None,
        };
        let graph = self.index_struct.read().clone();
        let mut stack: Vec<(String, f32)> =
            self.pick(query, query_vec.as_deref(), &graph.root_ids()).await?;
        stack.reverse();

        let mut leaves: Vec<(String, f32)> = Vec::new();
        while let Some((id, score)) = stack.pop() {
            if graph.is_leaf(&id) {
                leaves.push((id, score));
                continue;
            }
            let mut picks = self.pick(query, query_vec.as_deref(), graph.children(&id)).await?;
            debug!(node = %id, picked = picks.len(), "descending tree");
            picks.reverse();
            stack.extend(picks);
        }

        let ids: Vec<String> = leaves.iter().map(|(id, _)| id.clone()).collect();
        let nodes = self.docstore.get_nodes(&ids)?;
        Ok(nodes.into_iter().zip(leaves).map(|(n, (_, s))| NodeWithScore::new(n, s)).collect())
    }
}

#[async_trait]
impl Retriever for TreeRetriever {
    async fn retrieve(&self, query: &QueryBundle) -> Result<Vec<NodeWithScore>> {
        let hits = match self.mode {
            TreeRetrieverMode::AllLeaf => {
                let ids = self.index_struct.read().leaf_ids();
                self.all(ids)?
            }
            TreeRetrieverMode::Root => {
                let ids = self.index_struct.read().root_ids();
                self.all(ids)?
            }
            TreeRetrieverMode::SelectLeaf | TreeRetrieverMode::SelectLeafEmbedding => {
                self.select_leaves(query).await?
            }
        };
        debug!(mode = ?self.mode, hits = hits.len(), "tree retrieval");
        Ok(hits)
    }
}
