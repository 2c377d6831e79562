use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{RagError, Result};
use crate::models::Llm;
use crate::prompts::{PromptTemplate, QUERY_GEN_PROMPT};
use crate::schema::{NodeWithScore, QueryBundle};

use super::{Retriever, sort_with_ties};

/// Default rank offset for reciprocal rank fusion.
pub const DEFAULT_RRF_K: f32 = 60.0;

/// How per-retriever result lists are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMode {
    /// Highest score seen for each node.
    Simple,
    /// `sum(1 / (k + rank))` with 1-based ranks.
    #[default]
    ReciprocalRank,
    /// Min-max normalized scores, weighted and summed.
    RelativeScore,
    /// Scores normalized over `mean ± 3 std`, weighted and summed.
    DistBased,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    pub mode: FusionMode,
    pub similarity_top_k: usize,
    /// Total queries run, the original included. Extra queries need an LLM.
    pub num_queries: usize,
    /// One weight per retriever; normalized to sum to one. Uniform when `None`.
    pub retriever_weights: Option<Vec<f32>>,
    pub rrf_k: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            mode: FusionMode::ReciprocalRank,
            similarity_top_k: 2,
            num_queries: 1,
            retriever_weights: None,
            rrf_k: DEFAULT_RRF_K,
        }
    }
}

/// Runs several retrievers (optionally over LLM-generated query variants) and
/// fuses their results.
///
/// Children run concurrently; the first failure fails the whole call.
///
/// # Example
///
/// ```rust,ignore
/// let fusion = QueryFusionRetriever::new(
///     vec![vector_retriever, bm25_retriever],
///     FusionConfig { similarity_top_k: 5, ..FusionConfig::default() },
/// )?;
/// let hits = fusion.retrieve_str("what is ownership?").await?;
/// ```
pub struct QueryFusionRetriever {
    retrievers: Vec<Arc<dyn Retriever>>,
    weights: Vec<f32>,
    config: FusionConfig,
    llm: Option<Arc<dyn Llm>>,
    query_gen_template: PromptTemplate,
}

impl QueryFusionRetriever {
    /// # Errors
    ///
    /// Returns [`RagError::InvalidArgument`] for no retrievers, a zero top-k, or
    /// weights that do not match the retriever count, are negative or sum to zero.
    pub fn new(retrievers: Vec<Arc<dyn Retriever>>, config: FusionConfig) -> Result<Self> {
        if retrievers.is_empty() {
            return Err(RagError::InvalidArgument("fusion needs at least one retriever".into()));
        }
        if config.similarity_top_k == 0 {
            return Err(RagError::InvalidArgument("similarity_top_k must be > 0".into()));
        }
        let weights = match &config.retriever_weights {
            None => vec![1.0 / retrievers.len() as f32; retrievers.len()],
            Some(weights) => normalize_weights(weights, retrievers.len())?,
        };
        Ok(Self {
            retrievers,
            weights,
            config,
            llm: None,
            query_gen_template: PromptTemplate::new(QUERY_GEN_PROMPT),
        })
    }

    /// LLM used to generate query variants when `num_queries > 1`.
    pub fn with_llm(mut self, llm: Arc<dyn Llm>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_query_gen_template(mut self, template: PromptTemplate) -> Self {
        self.query_gen_template = template;
        self
    }

    /// Retriever weights after normalization.
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    async fn queries(&self, query: &QueryBundle) -> Result<Vec<QueryBundle>> {
        let mut queries = vec![query.clone()];
        let extra = self.config.num_queries.saturating_sub(1);
        let Some(llm) = self.llm.as_ref().filter(|_| extra > 0) else {
            return Ok(queries);
        };
        let prompt = self
            .query_gen_template
            .format(&[("num_queries", &extra.to_string()), ("query", &query.query_str)]);
        let response = llm.complete(&prompt).await?;
        for line in response.lines().map(str::trim).filter(|l| !l.is_empty()).take(extra) {
            let mut generated = QueryBundle::new(line);
            generated.filters = query.filters.clone();
            queries.push(generated);
        }
        info!(generated = queries.len() - 1, "generated fusion queries");
        Ok(queries)
    }
}

fn normalize_weights(weights: &[f32], expected: usize) -> Result<Vec<f32>> {
    if weights.len() != expected {
        return Err(RagError::InvalidArgument(format!(
            "{} weights for {expected} retrievers",
            weights.len()
        )));
    }
    if weights.iter().any(|w| w.is_nan() || *w < 0.0) {
        return Err(RagError::InvalidArgument("retriever weights must be non-negative".into()));
    }
    let total: f32 = weights.iter().sum();
    if total <= 0.0 {
        return Err(RagError::InvalidArgument("retriever weights must not sum to zero".into()));
    }
    Ok(weights.iter().map(|w| w / total).collect())
}

/// One child result list with the weight it carries.
struct Ranked {
    weight: f32,
    nodes: Vec<NodeWithScore>,
}

/// Accumulates per-node contributions. Contributions are summed in sorted order
/// so the total does not depend on which retriever reported first.
#[derive(Default)]
struct Accumulator {
    entries: BTreeMap<String, (NodeWithScore, Vec<f32>)>,
}

impl Accumulator {
    fn add(&mut self, hit: &NodeWithScore, contribution: f32) {
        self.entries
            .entry(hit.node.id.clone())
            .or_insert_with(|| (hit.clone(), Vec::new()))
            .1
            .push(contribution);
    }

    fn finish(self, combine: impl Fn(&[f32]) -> f32) -> Vec<NodeWithScore> {
        self.entries
            .into_values()
            .map(|(mut hit, mut parts)| {
                parts.sort_by(|a, b| b.total_cmp(a));
                hit.score = combine(&parts);
                hit
            })
            .collect()
    }
}

fn sum(parts: &[f32]) -> f32 {
    parts.iter().sum()
}

fn max(parts: &[f32]) -> f32 {
    parts.first().copied().unwrap_or_default()
}

fn simple(lists: &[Ranked]) -> Vec<NodeWithScore> {
    let mut acc = Accumulator::default();
    for hit in lists.iter().flat_map(|l| &l.nodes) {
        acc.add(hit, hit.score);
    }
    acc.finish(max)
}

fn reciprocal_rank(lists: &[Ranked], k: f32) -> Vec<NodeWithScore> {
    let mut acc = Accumulator::default();
    for list in lists {
        for (rank, hit) in list.nodes.iter().enumerate() {
            acc.add(hit, 1.0 / (k + (rank + 1) as f32));
        }
    }
    acc.finish(sum)
}

fn relative_score(lists: &[Ranked]) -> Vec<NodeWithScore> {
    let mut acc = Accumulator::default();
    for list in lists {
        let (lo, hi) = list.nodes.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), h| {
            (lo.min(h.score), hi.max(h.score))
        });
        for hit in &list.nodes {
            let normalized = if hi > lo { (hit.score - lo) / (hi - lo) } else { 1.0 };
            acc.add(hit, normalized * list.weight);
        }
    }
    acc.finish(sum)
}

fn dist_based(lists: &[Ranked]) -> Vec<NodeWithScore> {
    let mut acc = Accumulator::default();
    for list in lists.iter().filter(|l| !l.nodes.is_empty()) {
        let n = list.nodes.len() as f32;
        let mean = list.nodes.iter().map(|h| h.score).sum::<f32>() / n;
        let std = (list.nodes.iter().map(|h| (h.score - mean).powi(2)).sum::<f32>() / n).sqrt();
        let (lo, hi) = (mean - 3.0 * std, mean + 3.0 * std);
        for hit in &list.nodes {
            let normalized =
                if std > 0.0 { ((hit.score - lo) / (hi - lo)).clamp(0.0, 1.0) } else { 1.0 };
            acc.add(hit, normalized * list.weight);
        }
    }
    acc.finish(sum)
}

/// Merge `lists` under `mode`, sorted best first with ties broken by node id.
fn fuse(mode: FusionMode, lists: &[Ranked], rrf_k: f32) -> Vec<NodeWithScore> {
    let mut fused = match mode {
        FusionMode::Simple => simple(lists),
        FusionMode::ReciprocalRank => reciprocal_rank(lists, rrf_k),
        FusionMode::RelativeScore => relative_score(lists),
        FusionMode::DistBased => dist_based(lists),
    };
    sort_with_ties(&mut fused);
    fused
}

#[async_trait]
impl Retriever for QueryFusionRetriever {
    async fn retrieve(&self, query: &QueryBundle) -> Result<Vec<NodeWithScore>> {
        let queries = self.queries(query).await?;
        let per_query = queries.len() as f32;
        let tasks = queries.iter().flat_map(|q| {
            self.retrievers.iter().zip(&self.weights).map(move |(retriever, weight)| async move {
                let nodes = retriever.retrieve(q).await?;
                Ok::<_, RagError>(Ranked { weight: weight / per_query, nodes })
            })
        });
        let lists = try_join_all(tasks).await?;

        let mut fused = fuse(self.config.mode, &lists, self.config.rrf_k);
        fused.truncate(self.config.similarity_top_k);
        debug!(
            mode = ?self.config.mode,
            lists = lists.len(),
            hits = fused.len(),
            "fused retrieval results"
        );
        Ok(fused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MockLlm;
    use crate::schema::Node;

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

    struct Failing;

    #[async_trait]
    impl Retriever for Failing {
        async fn retrieve(&self, _query: &QueryBundle) -> Result<Vec<NodeWithScore>> {
            Err(RagError::upstream("test", "boom"))
        }
    }

    fn pair() -> Vec<Arc<dyn Retriever>> {
        vec![
            Arc::new(Fixed(vec![("n1", 0.9), ("n2", 0.8), ("n3", 0.7)])),
            Arc::new(Fixed(vec![("n3", 0.95), ("n1", 0.5)])),
        ]
    }

    async fn run(mode: FusionMode) -> Vec<NodeWithScore> {
        let config = FusionConfig { mode, similarity_top_k: 10, ..FusionConfig::default() };
        QueryFusionRetriever::new(pair(), config).unwrap().retrieve_str("q").await.unwrap()
    }

    fn ids(hits: &[NodeWithScore]) -> Vec<&str> {
        hits.iter().map(|h| h.id()).collect()
    }

    #[tokio::test]
    async fn simple_takes_max() {
        let hits = run(FusionMode::Simple).await;
        assert_eq!(ids(&hits), vec!["n3", "n1", "n2"]);
        assert_eq!(hits[0].score, 0.95);
        assert_eq!(hits[1].score, 0.9);
    }

    #[tokio::test]
    async fn relative_score_normalizes_each_list() {
        let hits = run(FusionMode::RelativeScore).await;
        // n1: 1.0*0.5 + 0.0*0.5, n3: 0.0*0.5 + 1.0*0.5, n2: 0.5*0.5
        assert_eq!(ids(&hits), vec!["n1", "n3", "n2"]);
        assert!((hits[0].score - 0.5).abs() < 1e-6);
        assert!((hits[2].score - 0.25).abs() < 1e-6);
    }

    #[tokio::test]
    async fn dist_based_with_constant_scores() {
        let retrievers: Vec<Arc<dyn Retriever>> =
            vec![Arc::new(Fixed(vec![("a", 0.3), ("b", 0.3)]))];
        let config = FusionConfig { mode: FusionMode::DistBased, ..FusionConfig::default() };
        let fusion = QueryFusionRetriever::new(retrievers, config).unwrap();
        let hits = fusion.retrieve_str("q").await.unwrap();
        assert!(hits.iter().all(|h| (h.score - 1.0).abs() < 1e-6));
    }

    #[test]
    fn weights_are_validated_and_normalized() {
        let config = FusionConfig { retriever_weights: Some(vec![3.0, 1.0]), ..Default::default() };
        let fusion = QueryFusionRetriever::new(pair(), config).unwrap();
        assert_eq!(fusion.weights(), &[0.75, 0.25]);

        for bad in [vec![1.0], vec![-1.0, 2.0], vec![0.0, 0.0]] {
            let config = FusionConfig { retriever_weights: Some(bad), ..Default::default() };
            assert!(matches!(
                QueryFusionRetriever::new(pair(), config),
                Err(RagError::InvalidArgument(_))
            ));
        }
    }

    #[tokio::test]
    async fn child_failure_fails_the_call() {
        let retrievers: Vec<Arc<dyn Retriever>> = vec![pair().remove(0), Arc::new(Failing)];
        let fusion = QueryFusionRetriever::new(retrievers, FusionConfig::default()).unwrap();
        assert!(matches!(fusion.retrieve_str("q").await, Err(RagError::Upstream { .. })));
    }

    #[tokio::test]
    async fn generated_queries_run_against_every_retriever() {
        let llm = Arc::new(MockLlm::fixed("variant one\nvariant two"));
        let config = FusionConfig { num_queries: 3, similarity_top_k: 10, ..Default::default() };
        let fusion = QueryFusionRetriever::new(pair(), config).unwrap().with_llm(llm.clone());
        let hits = fusion.retrieve_str("q").await.unwrap();
        assert_eq!(llm.calls(), 1);
        // three identical runs of each list: ranks, and so order, are unchanged
        assert_eq!(ids(&hits), vec!["n1", "n3", "n2"]);
        assert!((hits[0].score - 3.0 * (1.0 / 61.0 + 1.0 / 62.0)).abs() < 1e-5);
    }
}
