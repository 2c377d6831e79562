//! Question answering over retrieved nodes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::models::Llm;
use crate::postprocessor::{NodePostprocessor, apply_postprocessors};
use crate::prompts::{PromptTemplate, REFINE_PROMPT, TEXT_QA_PROMPT};
use crate::retrievers::Retriever;
use crate::schema::{MetadataMode, NodeWithScore, QueryBundle};

/// An answer with the nodes it was built from.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Response {
    pub response: String,
    pub source_nodes: Vec<NodeWithScore>,
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.response)
    }
}

/// Answers natural-language queries.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn query(&self, query: &QueryBundle) -> Result<Response>;

    async fn query_str(&self, query: &str) -> Result<Response> {
        self.query(&QueryBundle::new(query)).await
    }
}

/// Turns retrieved nodes into an answer.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, query: &QueryBundle, nodes: Vec<NodeWithScore>) -> Result<Response>;
}

/// Packs node texts into as few prompts as the model's context window allows,
/// answering the first pack and refining the answer with each following one.
pub struct CompactSynthesizer {
    llm: Arc<dyn Llm>,
    qa_template: PromptTemplate,
    refine_template: PromptTemplate,
    /// Rough prompt budget in characters.
    max_context_chars: usize,
}

impl fmt::Debug for CompactSynthesizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompactSynthesizer")
            .field("max_context_chars", &self.max_context_chars)
            .finish_non_exhaustive()
    }
}

impl CompactSynthesizer {
    pub fn new(llm: Arc<dyn Llm>) -> Self {
        let meta = llm.metadata();
        // ~4 characters per token
        let budget = meta.context_window.saturating_sub(meta.num_output).max(256) * 4;
        Self {
            llm,
            qa_template: PromptTemplate::new(TEXT_QA_PROMPT),
            refine_template: PromptTemplate::new(REFINE_PROMPT),
            max_context_chars: budget,
        }
    }

    pub fn with_qa_template(mut self, template: PromptTemplate) -> Self {
        self.qa_template = template;
        self
    }

    pub fn with_max_context_chars(mut self, chars: usize) -> Self {
        self.max_context_chars = chars.max(1);
        self
    }

    fn pack(&self, texts: Vec<String>) -> Vec<String> {
        let mut packs: Vec<String> = Vec::new();
        let mut current = String::new();
        for text in texts {
            if !current.is_empty() && current.len() + text.len() + 2 > self.max_context_chars {
                packs.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(&text);
        }
        if !current.is_empty() {
            packs.push(current);
        }
        packs
    }
}

#[async_trait]
impl Synthesizer for CompactSynthesizer {
    async fn synthesize(&self, query: &QueryBundle, nodes: Vec<NodeWithScore>) -> Result<Response> {
        let texts = nodes.iter().map(|n| n.node.content(MetadataMode::Llm)).collect();
        let packs = self.pack(texts);
        let mut answer: Option<String> = None;
        for context in &packs {
            let prompt = match &answer {
                None => self
                    .qa_template
                    .format(&[("context_str", context), ("query_str", &query.query_str)]),
                Some(existing) => self.refine_template.format(&[
                    ("context_msg", context),
                    ("query_str", &query.query_str),
                    ("existing_answer", existing),
                ]),
            };
            answer = Some(self.llm.complete(&prompt).await?);
        }
        debug!(packs = packs.len(), sources = nodes.len(), "synthesized response");
        Ok(Response { response: answer.unwrap_or_default(), source_nodes: nodes })
    }
}

/// Retrieve, post-process, then synthesize.
pub struct RetrieverQueryEngine {
    retriever: Arc<dyn Retriever>,
    synthesizer: Arc<dyn Synthesizer>,
    postprocessors: Vec<Arc<dyn NodePostprocessor>>,
}

impl RetrieverQueryEngine {
    pub fn new(retriever: Arc<dyn Retriever>, synthesizer: Arc<dyn Synthesizer>) -> Self {
        Self { retriever, synthesizer, postprocessors: Vec::new() }
    }

    pub fn with_postprocessor(mut self, postprocessor: Arc<dyn NodePostprocessor>) -> Self {
        self.postprocessors.push(postprocessor);
        self
    }

    /// Retrieved and post-processed nodes, without synthesis.
    pub async fn retrieve(&self, query: &QueryBundle) -> Result<Vec<NodeWithScore>> {
        let nodes = self.retriever.retrieve(query).await?;
        apply_postprocessors(&self.postprocessors, query, nodes).await
    }
}

#[async_trait]
impl QueryEngine for RetrieverQueryEngine {
    async fn query(&self, query: &QueryBundle) -> Result<Response> {
        let nodes = self.retrieve(query).await?;
        self.synthesizer.synthesize(query, nodes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MockLlm;
    use crate::schema::Node;

    struct Fixed(Vec<NodeWithScore>);

    #[async_trait]
    impl Retriever for Fixed {
        async fn retrieve(&self, _query: &QueryBundle) -> Result<Vec<NodeWithScore>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn single_pack_uses_qa_prompt() {
        let llm = Arc::new(MockLlm::fixed("42"));
        let engine = RetrieverQueryEngine::new(
            Arc::new(Fixed(vec![NodeWithScore::new(Node::with_id("a", "the answer is 42"), 1.0)])),
            Arc::new(CompactSynthesizer::new(llm.clone())),
        );
        let response = engine.query_str("what is the answer?").await.unwrap();
        assert_eq!(response.response, "42");
        assert_eq!(response.source_nodes.len(), 1);
        let prompt = &llm.prompts()[0];
        assert!(prompt.contains("the answer is 42") && prompt.contains("what is the answer?"));
    }

    #[tokio::test]
    async fn overflow_refines() {
        let llm = Arc::new(MockLlm::script(["draft", "final"]));
        let nodes = vec![
            NodeWithScore::new(Node::with_id("a", "x".repeat(40)), 1.0),
            NodeWithScore::new(Node::with_id("b", "y".repeat(40)), 0.5),
        ];
        let synth = CompactSynthesizer::new(llm.clone()).with_max_context_chars(50);
        let response = synth.synthesize(&QueryBundle::new("q"), nodes).await.unwrap();
        assert_eq!(response.response, "final");
        assert_eq!(llm.calls(), 2);
        assert!(llm.prompts()[1].contains("draft"));
    }
}
