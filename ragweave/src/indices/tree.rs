//! Tree index: leaves summarized bottom-up into a hierarchy.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::data_structs::{IndexGraph, IndexStruct};
use crate::error::{RagError, Result};
use crate::prompts::{
    PromptTemplate, SUMMARY_PROMPT, TREE_INSERT_PROMPT, extract_numbers, numbered_list,
};
use crate::retrievers::{Retriever, RetrieverOptions, TreeRetriever, TreeRetrieverMode};
use crate::schema::{Document, MetadataMode, Node};
use crate::settings::Settings;
use crate::storage::StorageContext;

use super::{Index, new_index_id, parse_documents};

/// Tree index parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeIndexConfig {
    /// Maximum children per node.
    pub num_children: usize,
    /// Summarize on construction. When off, leaves stay at the root level
    /// until [`TreeIndex::rebuild`] runs.
    pub build_tree: bool,
    /// Children picked per level by the select-leaf retrievers.
    pub child_branch_factor: usize,
}

impl Default for TreeIndexConfig {
    fn default() -> Self {
        Self { num_children: 10, build_tree: true, child_branch_factor: 1 }
    }
}

impl TreeIndexConfig {
    /// # Errors
    ///
    /// Returns [`RagError::InvalidArgument`] if `num_children < 2` or the branch factor is zero.
    pub fn validate(&self) -> Result<()> {
        if self.num_children < 2 {
            return Err(RagError::InvalidArgument("num_children must be at least 2".into()));
        }
        if self.child_branch_factor == 0 {
            return Err(RagError::InvalidArgument("child_branch_factor must be > 0".into()));
        }
        Ok(())
    }
}

/// Hierarchy of LLM summaries over leaf chunks.
///
/// Deleting nodes is not supported; rebuild the index instead.
pub struct TreeIndex {
    index_struct: Arc<RwLock<IndexGraph>>,
    storage: StorageContext,
    settings: Settings,
    config: TreeIndexConfig,
    summary_template: PromptTemplate,
    insert_template: PromptTemplate,
}

impl TreeIndex {
    pub async fn from_nodes(
        nodes: Vec<Node>,
        storage: StorageContext,
        settings: Settings,
        config: TreeIndexConfig,
    ) -> Result<Self> {
        config.validate()?;
        let index = Self::from_struct(IndexGraph::new(new_index_id()), storage, settings, config);
        let graph = index.build(IndexGraph::new(index.index_id()), nodes).await?;
        index.commit(graph)?;
        Ok(index)
    }

    pub async fn from_documents(
        documents: &[Document],
        storage: StorageContext,
        settings: Settings,
        config: TreeIndexConfig,
    ) -> Result<Self> {
        let nodes = parse_documents(documents, &settings, &storage)?;
        Self::from_nodes(nodes, storage, settings, config).await
    }

    pub fn from_struct(
        index_struct: IndexGraph,
        storage: StorageContext,
        settings: Settings,
        config: TreeIndexConfig,
    ) -> Self {
        Self {
            index_struct: Arc::new(RwLock::new(index_struct)),
            storage,
            settings,
            config,
            summary_template: PromptTemplate::new(SUMMARY_PROMPT),
            insert_template: PromptTemplate::new(TREE_INSERT_PROMPT),
        }
    }

    pub fn with_summary_template(mut self, template: PromptTemplate) -> Self {
        self.summary_template = template;
        self
    }

    pub fn with_insert_template(mut self, template: PromptTemplate) -> Self {
        self.insert_template = template;
        self
    }

    /// A retriever with an explicit mode.
    pub fn retriever(&self, mode: TreeRetrieverMode) -> TreeRetriever {
        TreeRetriever::new(
            self.index_struct.clone(),
            self.storage.docstore().clone(),
            self.settings.llm.clone(),
            self.settings.embed_model.clone(),
            mode,
        )
        .with_branching_factor(self.config.child_branch_factor)
    }

    /// Drop every summary node and summarize the current leaves again.
    ///
    /// Leaves that are no longer in the docstore are left out of the new tree.
    pub async fn rebuild(&self) -> Result<()> {
        let graph = self.index_struct.read().clone();
        let docstore = self.storage.docstore();
        let mut leaves = Vec::new();
        for id in graph.leaf_ids() {
            match docstore.get_document(&id, false)? {
                Some(node) => leaves.push(node),
                None => debug!(node_id = %id, "dropping leaf missing from docstore"),
            }
        }
        for id in graph.all_nodes.values().filter(|id| !graph.is_leaf(id)) {
            docstore.delete_document(id, false)?;
        }
        let config = TreeIndexConfig { build_tree: true, ..self.config.clone() };
        let rebuilt =
            self.build_with(IndexGraph::new(graph.index_id.clone()), leaves, &config).await?;
        self.commit(rebuilt)
    }

    fn commit(&self, graph: IndexGraph) -> Result<()> {
        *self.index_struct.write() = graph;
        self.storage.index_store().add_index_struct(&self.index_struct())
    }

    async fn build(&self, graph: IndexGraph, leaves: Vec<Node>) -> Result<IndexGraph> {
        self.build_with(graph, leaves, &self.config).await
    }

    async fn build_with(
        &self,
        mut graph: IndexGraph,
        leaves: Vec<Node>,
        config: &TreeIndexConfig,
    ) -> Result<IndexGraph> {
        self.storage.docstore().add_documents(&leaves, true)?;
        let mut level: Vec<Node> = leaves;
        for node in &level {
            graph.insert(&node.id, None);
        }
        let mut depth = 0;
        while config.build_tree && level.len() > config.num_children {
            let mut parents = Vec::new();
            for group in level.chunks(config.num_children) {
                let parent = self.summary_node(group).await?;
                graph.insert(&parent.id, None);
                for child in group {
                    graph.insert(&child.id, Some(&parent.id));
                    graph.root_nodes.retain(|_, id| id != &child.id);
                }
                parents.push(parent);
            }
            self.storage.docstore().add_documents(&parents, true)?;
            depth += 1;
            debug!(depth, nodes = parents.len(), "summarized tree level");
            level = parents;
        }
        info!(index_id = %graph.index_id, nodes = graph.size(), depth, "built tree index");
        Ok(graph)
    }

    async fn summarize(&self, texts: &[String]) -> Result<String> {
        let context = texts.join("\n\n");
        let prompt = self.summary_template.format(&[("context_str", &context)]);
        let summary = self.settings.llm.complete(&prompt).await?;
        if summary.trim().is_empty() {
            return Ok(context.chars().take(self.settings.chunk_size).collect());
        }
        Ok(summary.trim().to_string())
    }

    async fn summary_node(&self, children: &[Node]) -> Result<Node> {
        let texts: Vec<String> = children.iter().map(|n| n.content(MetadataMode::Llm)).collect();
        Ok(Node::new(self.summarize(&texts).await?))
    }

    /// Pick where a new node goes: `None` for the root level.
    async fn insertion_parent(&self, graph: &IndexGraph, node: &Node) -> Result<Option<String>> {
        let mut parent: Option<String> = None;
        loop {
            let candidates = match &parent {
                None => graph.root_ids(),
                Some(id) => graph.children(id).to_vec(),
            };
            if candidates.is_empty() || candidates.iter().all(|id| graph.is_leaf(id)) {
                return Ok(parent);
            }
            let chosen = if candidates.len() == 1 {
                candidates[0].clone()
            } else {
                let nodes = self.storage.docstore().get_nodes(&candidates)?;
                let texts: Vec<String> =
                    nodes.iter().map(|n| n.content(MetadataMode::Llm)).collect();
                let num_chunks = candidates.len().to_string();
                let prompt = self.insert_template.format(&[
                    ("num_chunks", &num_chunks),
                    ("context_list", &numbered_list(&texts)),
                    ("new_chunk_text", &node.content(MetadataMode::Llm)),
                ]);
                let answer = self.settings.llm.complete(&prompt).await?;
                let number = extract_numbers(&answer, 1)
                    .first()
                    .copied()
                    .filter(|n| (1..=candidates.len()).contains(n))
                    .ok_or_else(|| {
                        RagError::InvalidArgument(format!("no valid choice in answer '{answer}'"))
                    })?;
                candidates[number - 1].clone()
            };
            parent = Some(chosen);
        }
    }

    /// Split an overflowing child list under new intermediate summaries.
    async fn consolidate(&self, graph: &mut IndexGraph, parent: Option<&str>) -> Result<()> {
        let children = match parent {
            None => graph.root_ids(),
            Some(id) => graph.children(id).to_vec(),
        };
        if children.len() <= self.config.num_children {
            return Ok(());
        }
        let groups = children.len().div_ceil(self.config.num_children).max(2);
        let group_size = children.len().div_ceil(groups);
        let docstore = self.storage.docstore();
        let mut intermediates = Vec::with_capacity(groups);
        for group in children.chunks(group_size) {
            let nodes = docstore.get_nodes(group)?;
            let summary = self.summary_node(&nodes).await?;
            graph.insert(&summary.id, parent);
            for child in group {
                if let Some(id) = parent {
                    if let Some(list) = graph.node_id_to_children_ids.get_mut(id) {
                        list.retain(|c| c != child);
                    }
                } else {
                    graph.root_nodes.retain(|_, id| id != child);
                }
                graph.insert(child, Some(&summary.id));
            }
            intermediates.push(summary);
        }
        docstore.add_documents(&intermediates, true)?;
        debug!(parent = ?parent, groups = intermediates.len(), "split overflowing children");
        Ok(())
    }

    /// Re-summarize `start` and every ancestor above it.
    async fn refresh_summaries(&self, graph: &IndexGraph, start: &str) -> Result<()> {
        let docstore = self.storage.docstore();
        let mut current = Some(start.to_string());
        while let Some(id) = current {
            let children = docstore.get_nodes(graph.children(&id))?;
            let texts: Vec<String> =
                children.iter().map(|n| n.content(MetadataMode::Llm)).collect();
            let mut node = docstore.get_node(&id)?;
            node.set_text(self.summarize(&texts).await?);
            docstore.add_documents(std::slice::from_ref(&node), true)?;
            current = graph.parent_of(&id).map(str::to_string);
        }
        Ok(())
    }
}

#[async_trait]
impl Index for TreeIndex {
    fn index_id(&self) -> String {
        self.index_struct.read().index_id.clone()
    }

    fn index_struct(&self) -> IndexStruct {
        IndexStruct::Tree(self.index_struct.read().clone())
    }

    fn storage_context(&self) -> &StorageContext {
        &self.storage
    }

    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn as_retriever(&self, options: &RetrieverOptions) -> Result<Arc<dyn Retriever>> {
        let mode = match options.mode.as_deref() {
            None | Some("select_leaf") => TreeRetrieverMode::SelectLeaf,
            Some("select_leaf_embedding") => TreeRetrieverMode::SelectLeafEmbedding,
            Some("all_leaf") => TreeRetrieverMode::AllLeaf,
            Some("root") => TreeRetrieverMode::Root,
            Some(other) => {
                return Err(RagError::InvalidArgument(format!(
                    "unknown tree retriever mode '{other}'"
                )));
            }
        };
        Ok(Arc::new(self.retriever(mode)))
    }

    async fn insert_nodes(&self, nodes: Vec<Node>) -> Result<()> {
        let mut graph = self.index_struct.read().clone();
        for node in nodes {
            self.storage.docstore().add_documents(std::slice::from_ref(&node), true)?;
            let parent = self.insertion_parent(&graph, &node).await?;
            graph.insert(&node.id, parent.as_deref());
            self.consolidate(&mut graph, parent.as_deref()).await?;
            if let Some(parent) = &parent {
                self.refresh_summaries(&graph, parent).await?;
            }
            debug!(node_id = %node.id, parent = ?parent, "inserted into tree");
        }
        self.commit(graph)
    }

    async fn delete_nodes(&self, _node_ids: &[String], _delete_from_docstore: bool) -> Result<()> {
        Err(RagError::Unsupported("delete is not supported on tree indexes; use rebuild".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MockLlm;

    fn settings(llm: MockLlm) -> Settings {
        Settings::default().with_llm(Arc::new(llm))
    }

    fn leaves(n: usize) -> Vec<Node> {
        (1..=n).map(|i| Node::with_id(format!("L{i}"), format!("leaf number {i}"))).collect()
    }

    fn config(num_children: usize) -> TreeIndexConfig {
        TreeIndexConfig { num_children, ..TreeIndexConfig::default() }
    }

    fn assert_single_parents(graph: &IndexGraph) {
        for id in graph.all_nodes.values() {
            let parents = graph
                .node_id_to_children_ids
                .values()
                .filter(|children| children.contains(id))
                .count();
            let is_root = graph.root_nodes.values().any(|r| r == id);
            assert_eq!(parents, usize::from(!is_root), "node {id}");
        }
    }

    #[tokio::test]
    async fn builds_balanced_levels() {
        let index = TreeIndex::from_nodes(
            leaves(5),
            StorageContext::from_defaults(),
            settings(MockLlm::fixed("a summary")),
            config(2),
        )
        .await
        .unwrap();
        let IndexStruct::Tree(graph) = index.index_struct() else { panic!("not a tree") };
        // 5 leaves -> 3 parents -> 2 roots
        assert_eq!(graph.root_nodes.len(), 2);
        assert_eq!(graph.size(), 10);
        assert_eq!(graph.leaf_ids().len(), 5);
        assert_single_parents(&graph);
    }

    #[tokio::test]
    async fn empty_summary_falls_back_to_text() {
        let index = TreeIndex::from_nodes(
            leaves(3),
            StorageContext::from_defaults(),
            settings(MockLlm::fixed("  ")),
            config(2),
        )
        .await
        .unwrap();
        let IndexStruct::Tree(graph) = index.index_struct() else { panic!("not a tree") };
        let root = &graph.root_ids()[0];
        let node = index.storage_context().docstore().get_node(root).unwrap();
        assert!(node.text.starts_with("leaf number 1"));
    }

    #[tokio::test]
    async fn insert_overflow_splits_children() {
        let index = TreeIndex::from_nodes(
            leaves(2),
            StorageContext::from_defaults(),
            settings(MockLlm::fixed("ANSWER: 1")),
            config(2),
        )
        .await
        .unwrap();
        index.insert_nodes(vec![Node::with_id("L3", "leaf number 3")]).await.unwrap();
        let IndexStruct::Tree(graph) = index.index_struct() else { panic!("not a tree") };
        assert_eq!(graph.root_nodes.len(), 2);
        assert_eq!(graph.leaf_ids().len(), 3);
        assert_single_parents(&graph);
    }

    #[tokio::test]
    async fn delete_is_unsupported_and_rebuild_restores() {
        let index = TreeIndex::from_nodes(
            leaves(4),
            StorageContext::from_defaults(),
            settings(MockLlm::fixed("s")),
            TreeIndexConfig { build_tree: false, ..config(2) },
        )
        .await
        .unwrap();
        assert_eq!(index.index_struct().node_ids().len(), 4);
        let err = index.delete_nodes(&["L1".to_string()], true).await.unwrap_err();
        assert!(matches!(err, RagError::Unsupported(_)));

        index.rebuild().await.unwrap();
        let IndexStruct::Tree(graph) = index.index_struct() else { panic!("not a tree") };
        assert_eq!(graph.root_nodes.len(), 2);
        assert_single_parents(&graph);
    }

    #[tokio::test]
    async fn rebuild_skips_leaves_deleted_from_docstore() {
        let index = TreeIndex::from_nodes(
            leaves(5),
            StorageContext::from_defaults(),
            settings(MockLlm::fixed("s")),
            config(2),
        )
        .await
        .unwrap();
        index.storage_context().docstore().delete_document("L3", true).unwrap();

        index.rebuild().await.unwrap();
        let IndexStruct::Tree(graph) = index.index_struct() else { panic!("not a tree") };
        let leaf_ids = graph.leaf_ids();
        assert_eq!(leaf_ids.len(), 4);
        assert!(!leaf_ids.iter().any(|id| id == "L3"));
        // 4 leaves -> 2 parents at the root
        assert_eq!(graph.root_nodes.len(), 2);
        assert_single_parents(&graph);
    }
}
