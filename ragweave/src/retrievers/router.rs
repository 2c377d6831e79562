use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::info;

use crate::error::{RagError, Result};
use crate::schema::{NodeWithScore, QueryBundle};
use crate::selectors::Selector;
use crate::tools::{RetrieverTool, Tool, ToolMetadata};

use super::{Retriever, sort_with_ties};

/// Routes each query to the retrievers a selector picks.
///
/// Results of several picked retrievers are merged by node id, keeping the
/// highest score.
pub struct RouterRetriever {
    selector: Arc<dyn Selector>,
    tools: Vec<RetrieverTool>,
}

impl RouterRetriever {
    pub fn new(selector: Arc<dyn Selector>, tools: Vec<RetrieverTool>) -> Result<Self> {
        if tools.is_empty() {
            return Err(RagError::InvalidArgument("router needs at least one retriever".into()));
        }
        Ok(Self { selector, tools })
    }

    pub fn tools(&self) -> &[RetrieverTool] {
        &self.tools
    }
}

#[async_trait]
impl Retriever for RouterRetriever {
    async fn retrieve(&self, query: &QueryBundle) -> Result<Vec<NodeWithScore>> {
        let choices: Vec<ToolMetadata> = self.tools.iter().map(|t| t.metadata().clone()).collect();
        let result = self.selector.select(&choices, query).await?;
        let mut picked: Vec<&RetrieverTool> = Vec::with_capacity(result.selections.len());
        for selection in &result.selections {
            let tool = self.tools.get(selection.index).ok_or_else(|| {
                RagError::InvalidArgument(format!(
                    "selected retriever {} of {}",
                    selection.index,
                    self.tools.len()
                ))
            })?;
            info!(tool = %tool.metadata().name, reason = %selection.reason, "routing query");
            picked.push(tool);
        }
        if picked.is_empty() {
            return Err(RagError::InvalidArgument("selector picked no retriever".into()));
        }

        let lists = try_join_all(picked.iter().map(|t| t.retriever().retrieve(query))).await?;
        let mut merged: BTreeMap<String, NodeWithScore> = BTreeMap::new();
        for hit in lists.into_iter().flatten() {
            let kept = merged.get(hit.id()).is_some_and(|existing| existing.score >= hit.score);
            if !kept {
                merged.insert(hit.id().to_string(), hit);
            }
        }
        let mut hits: Vec<NodeWithScore> = merged.into_values().collect();
        sort_with_ties(&mut hits);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MockLlm;
    use crate::schema::Node;
    use crate::selectors::{LlmMultiSelector, LlmSingleSelector, SimpleSelector};

    struct Fixed(Vec<(&'static str, f32)>);

    #[async_trait]
    impl Retriever for Fixed {
        async fn retrieve(&self, _query: &QueryBundle) -> Result<Vec<NodeWithScore>> {
            Ok(self
                .0
                .iter()
                .map(|(id, s)| NodeWithScore::new(Node::with_id(*id, *id), *s))
                .collect())
        }
    }

    fn tools() -> Vec<RetrieverTool> {
        vec![
            RetrieverTool::new(
                Arc::new(Fixed(vec![("a", 0.2), ("b", 0.9)])),
                ToolMetadata::new("first", "First source"),
            ),
            RetrieverTool::new(
                Arc::new(Fixed(vec![("a", 0.8), ("c", 0.1)])),
                ToolMetadata::new("second", "Second source"),
            ),
        ]
    }

    fn ids(hits: &[NodeWithScore]) -> Vec<&str> {
        hits.iter().map(|h| h.id()).collect()
    }

    #[tokio::test]
    async fn single_choice_uses_one_retriever() {
        let selector = LlmSingleSelector::new(Arc::new(MockLlm::fixed("[{\"choice\": 2}]")));
        let router = RouterRetriever::new(Arc::new(selector), tools()).unwrap();
        let hits = router.retrieve_str("q").await.unwrap();
        assert_eq!(ids(&hits), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn multiple_choices_merge_by_max_score() {
        let router = RouterRetriever::new(Arc::new(SimpleSelector), tools()).unwrap();
        let hits = router.retrieve_str("q").await.unwrap();
        assert_eq!(ids(&hits), vec!["b", "a", "c"]);
        assert!((hits[1].score - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn invalid_choice_is_rejected() {
        let selector = LlmMultiSelector::new(Arc::new(MockLlm::fixed("[{\"choice\": 5}]")));
        let router = RouterRetriever::new(Arc::new(selector), tools()).unwrap();
        let err = router.retrieve_str("q").await.unwrap_err();
        assert!(matches!(err, RagError::InvalidArgument(_)));
        assert!(RouterRetriever::new(Arc::new(SimpleSelector), Vec::new()).is_err());
    }
}
