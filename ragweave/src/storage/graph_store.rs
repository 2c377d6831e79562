//! Triplet adjacency store backing the knowledge-graph index.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{RagError, Result};

/// Default cap on paths returned per subject by [`GraphStore::get_rel_map`].
pub const DEFAULT_REL_MAP_LIMIT: usize = 30;

/// A `(subject, predicate, object)` edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Triplet {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

impl Triplet {
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self { subject: subject.into(), predicate: predicate.into(), object: object.into() }
    }

    /// The triplet as a one-hop knowledge sequence, `s -[p]-> o`.
    pub fn rel_text(&self) -> String {
        RelPath {
            start: self.subject.clone(),
            hops: vec![RelHop {
                predicate: self.predicate.clone(),
                node: self.object.clone(),
                direction: Direction::Outgoing,
            }],
        }
        .to_string()
    }
}

impl fmt::Display for Triplet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.subject, self.predicate, self.object)
    }
}

/// Which way an edge was walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// One step of a [`RelPath`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelHop {
    pub predicate: String,
    pub node: String,
    pub direction: Direction,
}

/// A walk from a start entity, rendered like `a -[p]-> b <-[q]- c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelPath {
    pub start: String,
    pub hops: Vec<RelHop>,
}

impl RelPath {
    /// Entities visited, start included.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.start.as_str()).chain(self.hops.iter().map(|h| h.node.as_str()))
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.start)?;
        for hop in &self.hops {
            match hop.direction {
                Direction::Outgoing => write!(f, " -[{}]-> {}", hop.predicate, hop.node)?,
                Direction::Incoming => write!(f, " <-[{}]- {}", hop.predicate, hop.node)?,
            }
        }
        Ok(())
    }
}

/// Subject-keyed triplet storage with bidirectional traversal.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Outgoing `(predicate, object)` pairs of `subject`.
    async fn get(&self, subject: &str) -> Result<Vec<(String, String)>>;

    /// Paths of up to `depth` hops from each subject, following edges both ways
    /// without revisiting an entity. At most `limit` paths per subject.
    async fn get_rel_map(
        &self,
        subjects: &[String],
        depth: usize,
        limit: usize,
    ) -> Result<BTreeMap<String, Vec<RelPath>>>;

    async fn upsert_triplet(&self, triplet: &Triplet) -> Result<()>;

    async fn delete(&self, triplet: &Triplet) -> Result<()>;

    async fn persist(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Serializable contents of a [`SimpleGraphStore`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphStoreData {
    /// `subject -> [(predicate, object)]`.
    #[serde(default)]
    pub graph_dict: BTreeMap<String, Vec<(String, String)>>,
}

impl GraphStoreData {
    fn neighbours(&self, entity: &str) -> Vec<RelHop> {
        let mut hops: Vec<RelHop> = self
            .graph_dict
            .get(entity)
            .into_iter()
            .flatten()
            .map(|(p, o)| RelHop {
                predicate: p.clone(),
                node: o.clone(),
                direction: Direction::Outgoing,
            })
            .collect();
        for (subject, edges) in &self.graph_dict {
            for (p, o) in edges {
                if o == entity {
                    hops.push(RelHop {
                        predicate: p.clone(),
                        node: subject.clone(),
                        direction: Direction::Incoming,
                    });
                }
            }
        }
        hops
    }

    fn walk(
        &self,
        path: &mut RelPath,
        visited: &mut BTreeSet<String>,
        depth: usize,
        out: &mut Vec<RelPath>,
        limit: usize,
    ) {
        if depth == 0 || out.len() >= limit {
            return;
        }
        let tail = path.hops.last().map_or(path.start.clone(), |h| h.node.clone());
        for hop in self.neighbours(&tail) {
            if out.len() >= limit {
                return;
            }
            if visited.contains(&hop.node) {
                continue;
            }
            visited.insert(hop.node.clone());
            path.hops.push(hop);
            out.push(path.clone());
            self.walk(path, visited, depth - 1, out, limit);
            if let Some(done) = path.hops.pop() {
                visited.remove(&done.node);
            }
        }
    }
}

/// In-memory graph store.
#[derive(Debug, Default)]
pub struct SimpleGraphStore {
    data: RwLock<GraphStoreData>,
}

impl SimpleGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dict(data: GraphStoreData) -> Self {
        Self { data: RwLock::new(data) }
    }

    pub async fn to_dict(&self) -> GraphStoreData {
        self.data.read().await.clone()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.graph_dict.is_empty()
    }

    /// Load a store written by [`GraphStore::persist`]. A missing file yields an empty store.
    pub fn from_persist_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let bytes = fs::read(path)?;
        let data = serde_json::from_slice(&bytes)
            .map_err(|e| RagError::Decode(format!("{}: {e}", path.display())))?;
        Ok(Self::from_dict(data))
    }
}

#[async_trait]
impl GraphStore for SimpleGraphStore {
    async fn get(&self, subject: &str) -> Result<Vec<(String, String)>> {
        Ok(self.data.read().await.graph_dict.get(subject).cloned().unwrap_or_default())
    }

    async fn get_rel_map(
        &self,
        subjects: &[String],
        depth: usize,
        limit: usize,
    ) -> Result<BTreeMap<String, Vec<RelPath>>> {
        let data = self.data.read().await;
        let mut rel_map = BTreeMap::new();
        for subject in subjects {
            let mut out = Vec::new();
            let mut path = RelPath { start: subject.clone(), hops: Vec::new() };
            let mut visited = BTreeSet::from([subject.clone()]);
            data.walk(&mut path, &mut visited, depth, &mut out, limit);
            rel_map.insert(subject.clone(), out);
        }
        debug!(subjects = subjects.len(), depth, "computed rel map");
        Ok(rel_map)
    }

    async fn upsert_triplet(&self, triplet: &Triplet) -> Result<()> {
        let mut data = self.data.write().await;
        let edges = data.graph_dict.entry(triplet.subject.clone()).or_default();
        let edge = (triplet.predicate.clone(), triplet.object.clone());
        if !edges.contains(&edge) {
            edges.push(edge);
        }
        Ok(())
    }

    async fn delete(&self, triplet: &Triplet) -> Result<()> {
        let mut data = self.data.write().await;
        if let Some(edges) = data.graph_dict.get_mut(&triplet.subject) {
            edges.retain(|(p, o)| p != &triplet.predicate || o != &triplet.object);
            if edges.is_empty() {
                data.graph_dict.remove(&triplet.subject);
            }
        }
        Ok(())
    }

    async fn persist(&self, path: &Path) -> Result<()> {
        let data = self.data.read().await;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec(&*data)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(triplets: &[(&str, &str, &str)]) -> SimpleGraphStore {
        let store = SimpleGraphStore::new();
        for (s, p, o) in triplets {
            store.upsert_triplet(&Triplet::new(*s, *p, *o)).await.unwrap();
        }
        store
    }

    #[test]
    fn triplet_display() {
        assert_eq!(Triplet::new("a", "likes", "b").to_string(), "(a, likes, b)");
        assert_eq!(Triplet::new("a", "likes", "b").rel_text(), "a -[likes]-> b");
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_delete_prunes() {
        let s = store(&[("a", "likes", "b"), ("a", "likes", "b")]).await;
        assert_eq!(s.get("a").await.unwrap().len(), 1);
        s.delete(&Triplet::new("a", "likes", "b")).await.unwrap();
        assert!(s.is_empty().await);
    }

    #[tokio::test]
    async fn rel_map_walks_both_directions() {
        let s = store(&[("alice", "knows", "bob"), ("carol", "manages", "bob")]).await;
        let map = s.get_rel_map(&["alice".to_string()], 2, DEFAULT_REL_MAP_LIMIT).await.unwrap();
        let rendered: Vec<String> = map["alice"].iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec!["alice -[knows]-> bob", "alice -[knows]-> bob <-[manages]- carol"]
        );
    }

    #[tokio::test]
    async fn rel_map_is_cycle_safe_and_limited() {
        let s = store(&[("a", "r", "b"), ("b", "r", "c"), ("c", "r", "a")]).await;
        let map = s.get_rel_map(&["a".to_string()], 10, 100).await.unwrap();
        for path in &map["a"] {
            let nodes: Vec<&str> = path.nodes().collect();
            let unique: BTreeSet<&str> = nodes.iter().copied().collect();
            assert_eq!(nodes.len(), unique.len());
        }
        let limited = s.get_rel_map(&["a".to_string()], 10, 1).await.unwrap();
        assert_eq!(limited["a"].len(), 1);
    }
}
