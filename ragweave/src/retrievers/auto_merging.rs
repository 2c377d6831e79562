use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RagError, Result};
use crate::schema::{NodeWithScore, QueryBundle};
use crate::storage::DocStore;

use super::{Retriever, sort_with_ties};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoMergingConfig {
    /// Children are replaced by their parent once more than this share of them is retrieved.
    pub simple_ratio_thresh: f32,
}

impl Default for AutoMergingConfig {
    fn default() -> Self {
        Self { simple_ratio_thresh: 0.5 }
    }
}

impl AutoMergingConfig {
    /// # Errors
    ///
    /// Returns [`RagError::InvalidArgument`] unless the threshold is in `[0, 1)`.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.simple_ratio_thresh) {
            return Err(RagError::InvalidArgument(format!(
                "simple_ratio_thresh must be in [0, 1), got {}",
                self.simple_ratio_thresh
            )));
        }
        Ok(())
    }
}

/// Wraps a leaf retriever and climbs to parents when enough siblings match.
///
/// Nodes need `Parent`/`Child` relationships, as produced by
/// [`HierarchicalNodeParser`](crate::node_parser::HierarchicalNodeParser), and
/// every parent must be in the docstore.
pub struct AutoMergingRetriever {
    base: Arc<dyn Retriever>,
    docstore: Arc<DocStore>,
    config: AutoMergingConfig,
}

impl AutoMergingRetriever {
    pub fn new(
        base: Arc<dyn Retriever>,
        docstore: Arc<DocStore>,
        config: AutoMergingConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self { base, docstore, config })
    }

    /// Insert a missing middle node between two hits linked through it by Next/Previous.
    ///
    /// Ids in `absorbed` were already merged into a parent and are never refilled.
    fn fill_gaps(
        &self,
        nodes: &mut Vec<NodeWithScore>,
        absorbed: &BTreeSet<String>,
    ) -> Result<bool> {
        let present: BTreeSet<String> = nodes.iter().map(|n| n.id().to_string()).collect();
        let mut gaps: BTreeMap<String, f32> = BTreeMap::new();
        for left in nodes.iter() {
            let Some(middle) = left.node.next().map(|r| r.node_id.as_str()) else {
                continue;
            };
            if present.contains(middle) || absorbed.contains(middle) {
                continue;
            }
            if gaps.contains_key(middle) {
                continue;
            }
            let right = nodes
                .iter()
                .find(|n| n.node.prev().is_some_and(|r| r.node_id == middle));
            if let Some(right) = right {
                gaps.insert(middle.to_string(), (left.score + right.score) / 2.0);
            }
        }
        for (id, score) in &gaps {
            debug!(node_id = %id, score, "filled retrieval gap");
            nodes.push(NodeWithScore::new(self.docstore.get_node(id)?, *score));
        }
        Ok(!gaps.is_empty())
    }

    /// Replace children by their parent where the retrieved share exceeds the threshold,
    /// recording the replaced ids in `absorbed`.
    fn merge_into_parents(
        &self,
        nodes: &mut Vec<NodeWithScore>,
        absorbed: &mut BTreeSet<String>,
    ) -> Result<bool> {
        let mut by_parent: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, hit) in nodes.iter().enumerate() {
            if let Some(parent) = hit.node.parent() {
                by_parent.entry(parent.node_id.clone()).or_default().push(i);
            }
        }

        let mut replaced: BTreeSet<usize> = BTreeSet::new();
        let mut parents: Vec<NodeWithScore> = Vec::new();
        for (parent_id, members) in by_parent {
            let parent = self.docstore.get_node(&parent_id)?;
            let total = parent.children().len();
            if total == 0 {
                continue;
            }
            let ratio = members.len() as f32 / total as f32;
            if ratio <= self.config.simple_ratio_thresh {
                continue;
            }
            let score = members.iter().map(|&i| nodes[i].score).sum::<f32>() / members.len() as f32;
            debug!(parent = %parent_id, ratio, score, "merging children into parent");
            replaced.extend(members);
            parents.push(NodeWithScore::new(parent, score));
        }
        if parents.is_empty() {
            return Ok(false);
        }

        let mut kept: Vec<NodeWithScore> = std::mem::take(nodes)
            .into_iter()
            .enumerate()
            .filter_map(|(i, n)| {
                if replaced.contains(&i) {
                    absorbed.insert(n.node.id);
                    None
                } else {
                    Some(n)
                }
            })
            .collect();
        for parent in parents {
            match kept.iter_mut().find(|n| n.id() == parent.id()) {
                Some(existing) => existing.score = existing.score.max(parent.score),
                None => kept.push(parent),
            }
        }
        *nodes = kept;
        Ok(true)
    }
}

#[async_trait]
impl Retriever for AutoMergingRetriever {
    async fn retrieve(&self, query: &QueryBundle) -> Result<Vec<NodeWithScore>> {
        let mut nodes = self.base.retrieve(query).await?;
        let mut absorbed: BTreeSet<String> = BTreeSet::new();
        loop {
            let filled = self.fill_gaps(&mut nodes, &absorbed)?;
            let merged = self.merge_into_parents(&mut nodes, &mut absorbed)?;
            if !filled && !merged {
                break;
            }
        }
        sort_with_ties(&mut nodes);
        Ok(nodes)
    }
}
