//! Persisted index shapes, one variant per index kind.
//!
//! Serialized as `{"__type__": "<tag>", "__data__": {...}}`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::storage::Triplet;

/// Vector index: text-store id to node id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IndexDict {
    pub index_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub nodes_dict: BTreeMap<String, String>,
}

impl IndexDict {
    pub fn new(index_id: impl Into<String>) -> Self {
        Self { index_id: index_id.into(), ..Self::default() }
    }

    /// Record that `node_id` is stored under `text_id` in the vector store.
    pub fn add_node(&mut self, node_id: &str, text_id: &str) {
        self.nodes_dict.insert(text_id.to_string(), node_id.to_string());
    }

    /// Forget a node under either of its ids.
    pub fn delete(&mut self, id: &str) {
        self.nodes_dict.retain(|text_id, node_id| text_id != id && node_id != id);
    }
}

/// Summary (list) index: ordered node ids.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IndexList {
    pub index_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl IndexList {
    pub fn new(index_id: impl Into<String>) -> Self {
        Self { index_id: index_id.into(), ..Self::default() }
    }

    pub fn add_node(&mut self, node_id: &str) {
        if !self.nodes.iter().any(|n| n == node_id) {
            self.nodes.push(node_id.to_string());
        }
    }
}

/// Keyword table: keyword to node ids.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KeywordTable {
    pub index_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub table: BTreeMap<String, BTreeSet<String>>,
}

impl KeywordTable {
    pub fn new(index_id: impl Into<String>) -> Self {
        Self { index_id: index_id.into(), ..Self::default() }
    }

    pub fn add_node<I, S>(&mut self, keywords: I, node_id: &str)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for keyword in keywords {
            self.table.entry(keyword.into()).or_default().insert(node_id.to_string());
        }
    }

    /// Remove `node_id` everywhere, dropping keywords left empty.
    pub fn delete_node(&mut self, node_id: &str) {
        for ids in self.table.values_mut() {
            ids.remove(node_id);
        }
        self.table.retain(|_, ids| !ids.is_empty());
    }

    /// Every node id referenced by the table.
    pub fn node_ids(&self) -> BTreeSet<String> {
        self.table.values().flatten().cloned().collect()
    }

    pub fn keywords(&self) -> impl Iterator<Item = &String> {
        self.table.keys()
    }
}

/// Tree index: positional node map, roots and parent-to-children links.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IndexGraph {
    pub index_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub all_nodes: BTreeMap<usize, String>,
    #[serde(default)]
    pub root_nodes: BTreeMap<usize, String>,
    #[serde(default)]
    pub node_id_to_children_ids: BTreeMap<String, Vec<String>>,
}

impl IndexGraph {
    pub fn new(index_id: impl Into<String>) -> Self {
        Self { index_id: index_id.into(), ..Self::default() }
    }

    pub fn size(&self) -> usize {
        self.all_nodes.len()
    }

    /// Position of `node_id` in `all_nodes`.
    pub fn index_of(&self, node_id: &str) -> Option<usize> {
        self.all_nodes.iter().find(|(_, id)| id.as_str() == node_id).map(|(i, _)| *i)
    }

    /// Append `node_id` at the next free position, optionally under `parent_id`.
    pub fn insert(&mut self, node_id: &str, parent_id: Option<&str>) -> usize {
        let index = match self.index_of(node_id) {
            Some(i) => i,
            None => {
                let i = self.all_nodes.keys().next_back().map_or(0, |k| k + 1);
                self.all_nodes.insert(i, node_id.to_string());
                i
            }
        };
        match parent_id {
            Some(parent) => {
                let children = self.node_id_to_children_ids.entry(parent.to_string()).or_default();
                if !children.iter().any(|c| c == node_id) {
                    children.push(node_id.to_string());
                }
            }
            None => {
                self.root_nodes.insert(index, node_id.to_string());
            }
        }
        self.node_id_to_children_ids.entry(node_id.to_string()).or_default();
        index
    }

    /// Children of `node_id`, in insertion order.
    pub fn children(&self, node_id: &str) -> &[String] {
        self.node_id_to_children_ids.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_leaf(&self, node_id: &str) -> bool {
        self.children(node_id).is_empty()
    }

    /// The node whose child list holds `node_id`.
    pub fn parent_of(&self, node_id: &str) -> Option<&str> {
        self.node_id_to_children_ids
            .iter()
            .find(|(_, children)| children.iter().any(|c| c == node_id))
            .map(|(parent, _)| parent.as_str())
    }

    pub fn root_ids(&self) -> Vec<String> {
        self.root_nodes.values().cloned().collect()
    }

    pub fn leaf_ids(&self) -> Vec<String> {
        self.all_nodes.values().filter(|id| self.is_leaf(id)).cloned().collect()
    }
}

/// Knowledge-graph index: keyword table plus triplet embeddings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KgIndexStruct {
    pub index_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub table: BTreeMap<String, BTreeSet<String>>,
    /// `"(s, p, o)"` text to embedding.
    #[serde(default)]
    pub embedding_dict: BTreeMap<String, Vec<f32>>,
    /// Every chunk the index was built from, with or without triplets.
    #[serde(default)]
    pub nodes: BTreeSet<String>,
    /// Triplets this index wrote to the graph store.
    #[serde(default)]
    pub triplets: BTreeSet<Triplet>,
}

impl KgIndexStruct {
    pub fn new(index_id: impl Into<String>) -> Self {
        Self { index_id: index_id.into(), ..Self::default() }
    }

    pub fn add_node<I, S>(&mut self, keywords: I, node_id: &str)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for keyword in keywords {
            self.table.entry(keyword.into()).or_default().insert(node_id.to_string());
        }
    }

    pub fn add_to_embedding_dict(&mut self, triplet_text: impl Into<String>, embedding: Vec<f32>) {
        self.embedding_dict.insert(triplet_text.into(), embedding);
    }

    /// Record a chunk as indexed even if it yielded no triplets.
    pub fn track_node(&mut self, node_id: &str) {
        self.nodes.insert(node_id.to_string());
    }

    pub fn track_triplet(&mut self, triplet: &Triplet) {
        self.triplets.insert(triplet.clone());
    }

    pub fn node_ids(&self) -> BTreeSet<String> {
        self.table.values().flatten().chain(&self.nodes).cloned().collect()
    }

    /// Node ids listed under `keyword`.
    pub fn search_node_by_keyword(&self, keyword: &str) -> Vec<String> {
        self.table.get(keyword).map(|ids| ids.iter().cloned().collect()).unwrap_or_default()
    }
}

/// Any persisted index shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__type__", content = "__data__")]
pub enum IndexStruct {
    #[serde(rename = "vector")]
    Vector(IndexDict),
    #[serde(rename = "list")]
    List(IndexList),
    #[serde(rename = "keyword_table")]
    KeywordTable(KeywordTable),
    #[serde(rename = "tree")]
    Tree(IndexGraph),
    #[serde(rename = "kg")]
    Kg(KgIndexStruct),
}

impl IndexStruct {
    pub fn index_id(&self) -> &str {
        match self {
            Self::Vector(s) => &s.index_id,
            Self::List(s) => &s.index_id,
            Self::KeywordTable(s) => &s.index_id,
            Self::Tree(s) => &s.index_id,
            Self::Kg(s) => &s.index_id,
        }
    }

    /// The envelope tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Vector(_) => "vector",
            Self::List(_) => "list",
            Self::KeywordTable(_) => "keyword_table",
            Self::Tree(_) => "tree",
            Self::Kg(_) => "kg",
        }
    }

    /// Every node id the struct references.
    pub fn node_ids(&self) -> BTreeSet<String> {
        match self {
            Self::Vector(s) => s.nodes_dict.values().cloned().collect(),
            Self::List(s) => s.nodes.iter().cloned().collect(),
            Self::KeywordTable(s) => s.node_ids(),
            Self::Tree(s) => s.all_nodes.values().cloned().collect(),
            Self::Kg(s) => s.node_ids(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_tags() {
        let mut dict = IndexDict::new("v");
        dict.add_node("n1", "t1");
        let json = serde_json::to_value(IndexStruct::Vector(dict.clone())).unwrap();
        assert_eq!(json["__type__"], "vector");
        assert_eq!(json["__data__"]["nodes_dict"]["t1"], "n1");
        let back: IndexStruct = serde_json::from_value(json).unwrap();
        assert_eq!(back, IndexStruct::Vector(dict));
    }

    #[test]
    fn every_variant_survives_json() {
        let mut graph = IndexGraph::new("t");
        graph.insert("root", None);
        graph.insert("leaf", Some("root"));
        let mut kg = KgIndexStruct::new("k");
        kg.add_node(["alice"], "n1");
        kg.add_to_embedding_dict("(alice, knows, bob)", vec![0.5, 0.5]);
        kg.track_node("n3");
        kg.track_triplet(&Triplet::new("alice", "knows", "bob"));
        let mut kw = KeywordTable::new("kw");
        kw.add_node(["cats", "dogs"], "n2");
        let mut list = IndexList::new("l");
        list.add_node("a");

        for s in [
            IndexStruct::Tree(graph),
            IndexStruct::Kg(kg),
            IndexStruct::KeywordTable(kw),
            IndexStruct::List(list),
        ] {
            let text = serde_json::to_string(&s).unwrap();
            assert_eq!(serde_json::from_str::<IndexStruct>(&text).unwrap(), s);
        }
    }

    #[test]
    fn graph_links() {
        let mut graph = IndexGraph::new("t");
        graph.insert("p", None);
        graph.insert("a", Some("p"));
        graph.insert("b", Some("p"));
        assert_eq!(graph.children("p"), ["a", "b"]);
        assert_eq!(graph.parent_of("b"), Some("p"));
        assert_eq!(graph.root_ids(), vec!["p"]);
        assert_eq!(graph.leaf_ids(), vec!["a", "b"]);
        assert_eq!(graph.index_of("b"), Some(2));
    }

    #[test]
    fn keyword_delete_prunes_empty_entries() {
        let mut kw = KeywordTable::new("kw");
        kw.add_node(["cats"], "n1");
        kw.add_node(["cats", "mats"], "n2");
        kw.delete_node("n2");
        assert_eq!(kw.keywords().collect::<Vec<_>>(), vec!["cats"]);
        assert_eq!(kw.node_ids().len(), 1);
    }
}
