//! Post-retrieval filters and re-scorers.

use async_trait::async_trait;

use crate::error::Result;
use crate::schema::{MetadataMode, NodeWithScore, QueryBundle};

/// Transforms retrieved nodes before they reach a tool or a synthesizer.
///
/// Implementations can drop, reorder or re-score nodes.
#[async_trait]
pub trait NodePostprocessor: Send + Sync {
    async fn postprocess(
        &self,
        query: &QueryBundle,
        nodes: Vec<NodeWithScore>,
    ) -> Result<Vec<NodeWithScore>>;
}

/// Run `nodes` through each postprocessor in order.
pub async fn apply_postprocessors(
    postprocessors: &[std::sync::Arc<dyn NodePostprocessor>],
    query: &QueryBundle,
    mut nodes: Vec<NodeWithScore>,
) -> Result<Vec<NodeWithScore>> {
    for p in postprocessors {
        nodes = p.postprocess(query, nodes).await?;
    }
    Ok(nodes)
}

/// Returns nodes unchanged.
///
/// # Example
///
/// ```rust,ignore
/// use ragweave::postprocessor::{NoOpPostprocessor, NodePostprocessor};
///
/// let same = NoOpPostprocessor.postprocess(&query, nodes).await?;
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpPostprocessor;

#[async_trait]
impl NodePostprocessor for NoOpPostprocessor {
    async fn postprocess(
        &self,
        _query: &QueryBundle,
        nodes: Vec<NodeWithScore>,
    ) -> Result<Vec<NodeWithScore>> {
        Ok(nodes)
    }
}

/// Drops nodes scoring below `cutoff`.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityPostprocessor {
    pub cutoff: f32,
}

impl SimilarityPostprocessor {
    pub fn new(cutoff: f32) -> Self {
        Self { cutoff }
    }
}

#[async_trait]
impl NodePostprocessor for SimilarityPostprocessor {
    async fn postprocess(
        &self,
        _query: &QueryBundle,
        nodes: Vec<NodeWithScore>,
    ) -> Result<Vec<NodeWithScore>> {
        Ok(nodes.into_iter().filter(|n| n.score >= self.cutoff).collect())
    }
}

/// Keeps nodes containing every required keyword and none of the excluded ones.
/// Matching is case-insensitive over the node text.
#[derive(Debug, Clone, Default)]
pub struct KeywordPostprocessor {
    pub required_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
}

impl KeywordPostprocessor {
    pub fn new<I, J, S, T>(required: I, excluded: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            required_keywords: required.into_iter().map(|k| k.into().to_lowercase()).collect(),
            exclude_keywords: excluded.into_iter().map(|k| k.into().to_lowercase()).collect(),
        }
    }
}

#[async_trait]
impl NodePostprocessor for KeywordPostprocessor {
    async fn postprocess(
        &self,
        _query: &QueryBundle,
        nodes: Vec<NodeWithScore>,
    ) -> Result<Vec<NodeWithScore>> {
        Ok(nodes
            .into_iter()
            .filter(|n| {
                let text = n.node.content(MetadataMode::None).to_lowercase();
                self.required_keywords.iter().all(|k| text.contains(k.as_str()))
                    && !self.exclude_keywords.iter().any(|k| text.contains(k.as_str()))
            })
            .collect())
    }
}
