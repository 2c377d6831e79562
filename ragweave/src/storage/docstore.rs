//! Node persistence over a [`KvStore`], with hashing and source-document tracking.
//!
//! A namespace is split into three collections:
//! - `<ns>/data`: node envelopes
//! - `<ns>/metadata`: `{doc_hash, ref_doc_id?}` per node
//! - `<ns>/ref_doc_info`: [`RefDocInfo`] per source document

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RagError, Result};
use crate::schema::{Metadata, Node, json_to_node, node_to_json};

use super::kvstore::{KvStore, SimpleKvStore};

/// Namespace used when none is given.
pub const DEFAULT_DOCSTORE_NAMESPACE: &str = "docstore";

/// The nodes derived from one source document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RefDocInfo {
    /// Ids of derived nodes, in insertion order.
    pub node_ids: Vec<String>,
    /// Metadata of the source document.
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NodeMetadata {
    doc_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ref_doc_id: Option<String>,
}

/// Document store: nodes keyed by id, plus hashes and ref-doc bookkeeping.
#[derive(Clone)]
pub struct DocStore {
    kv: Arc<dyn KvStore>,
    namespace: String,
}

impl fmt::Debug for DocStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocStore").field("namespace", &self.namespace).finish_non_exhaustive()
    }
}

impl Default for DocStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl DocStore {
    /// Docstore over an existing KV store.
    pub fn new(kv: Arc<dyn KvStore>, namespace: impl Into<String>) -> Self {
        Self { kv, namespace: namespace.into() }
    }

    /// Docstore over a fresh in-memory KV store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(SimpleKvStore::new()), DEFAULT_DOCSTORE_NAMESPACE)
    }

    /// Load a docstore persisted at `path`; missing files yield an empty store.
    pub fn from_persist_path(path: &Path) -> Result<Self> {
        Ok(Self::new(Arc::new(SimpleKvStore::from_persist_path(path)?), DEFAULT_DOCSTORE_NAMESPACE))
    }

    /// Write the underlying KV store to `path`.
    pub fn persist(&self, path: &Path) -> Result<()> {
        self.kv.persist(path)
    }

    fn data_collection(&self) -> String {
        format!("{}/data", self.namespace)
    }

    fn metadata_collection(&self) -> String {
        format!("{}/metadata", self.namespace)
    }

    fn ref_doc_collection(&self) -> String {
        format!("{}/ref_doc_info", self.namespace)
    }

    /// Store `nodes`.
    ///
    /// # Errors
    ///
    /// - [`RagError::InvalidArgument`] for a node with an empty id.
    /// - [`RagError::AlreadyExists`] if `allow_update` is false and the id is taken.
    pub fn add_documents(&self, nodes: &[Node], allow_update: bool) -> Result<()> {
        for node in nodes {
            if node.id.is_empty() {
                return Err(RagError::InvalidArgument("node id must not be empty".to_string()));
            }
            if !allow_update && self.document_exists(&node.id)? {
                return Err(RagError::AlreadyExists { id: node.id.clone() });
            }
            self.kv.put(&node.id, node_to_json(node)?, &self.data_collection())?;

            let meta = NodeMetadata {
                doc_hash: node.hash.clone(),
                ref_doc_id: node.ref_doc_id().map(str::to_string),
            };
            self.kv.put(&node.id, serde_json::to_value(&meta)?, &self.metadata_collection())?;

            if let Some(source) = node.source() {
                let mut info = self.get_ref_doc_info(&source.node_id)?.unwrap_or_default();
                if !info.node_ids.contains(&node.id) {
                    info.node_ids.push(node.id.clone());
                }
                if info.metadata.is_empty() {
                    info.metadata = source.metadata.clone();
                }
                self.kv.put(
                    &source.node_id,
                    serde_json::to_value(&info)?,
                    &self.ref_doc_collection(),
                )?;
            }
        }
        debug!(count = nodes.len(), namespace = %self.namespace, "added nodes to docstore");
        Ok(())
    }

    /// Fetch a node. On a miss returns [`RagError::NotFound`] if `raise_error`, else `None`.
    pub fn get_document(&self, id: &str, raise_error: bool) -> Result<Option<Node>> {
        match self.kv.get(id, &self.data_collection())? {
            Some(value) => Ok(Some(json_to_node(value)?)),
            None if raise_error => Err(RagError::node_not_found(id)),
            None => Ok(None),
        }
    }

    /// Fetch a node that must exist.
    pub fn get_node(&self, id: &str) -> Result<Node> {
        self.get_document(id, true)?.ok_or_else(|| RagError::node_not_found(id))
    }

    /// Fetch several nodes in order; every id must exist.
    pub fn get_nodes(&self, ids: &[String]) -> Result<Vec<Node>> {
        ids.iter().map(|id| self.get_node(id)).collect()
    }

    /// Every stored node keyed by id.
    pub fn docs(&self) -> Result<BTreeMap<String, Node>> {
        self.kv
            .get_all(&self.data_collection())?
            .into_iter()
            .map(|(id, value)| Ok((id, json_to_node(value)?)))
            .collect()
    }

    /// Whether a node with this id is stored.
    pub fn document_exists(&self, id: &str) -> Result<bool> {
        Ok(self.kv.get(id, &self.data_collection())?.is_some())
    }

    fn node_metadata(&self, id: &str) -> Result<Option<NodeMetadata>> {
        self.kv
            .get(id, &self.metadata_collection())?
            .map(|v| serde_json::from_value(v).map_err(RagError::from))
            .transpose()
    }

    /// Remove a node, its metadata and its entry in the owning [`RefDocInfo`].
    pub fn delete_document(&self, id: &str, raise_error: bool) -> Result<()> {
        if !self.document_exists(id)? {
            return if raise_error { Err(RagError::node_not_found(id)) } else { Ok(()) };
        }
        if let Some(ref_doc_id) = self.node_metadata(id)?.and_then(|m| m.ref_doc_id) {
            if let Some(mut info) = self.get_ref_doc_info(&ref_doc_id)? {
                info.node_ids.retain(|n| n != id);
                if info.node_ids.is_empty() {
                    self.kv.delete(&ref_doc_id, &self.ref_doc_collection())?;
                } else {
                    self.kv.put(
                        &ref_doc_id,
                        serde_json::to_value(&info)?,
                        &self.ref_doc_collection(),
                    )?;
                }
            }
        }
        self.kv.delete(id, &self.data_collection())?;
        self.kv.delete(id, &self.metadata_collection())?;
        Ok(())
    }

    /// Delete every node derived from `ref_doc_id`, then the ref-doc record itself.
    pub fn delete_ref_doc(&self, ref_doc_id: &str, raise_error: bool) -> Result<()> {
        let Some(info) = self.get_ref_doc_info(ref_doc_id)? else {
            return if raise_error {
                Err(RagError::NotFound { kind: "ref doc", id: ref_doc_id.to_string() })
            } else {
                Ok(())
            };
        };
        for node_id in &info.node_ids {
            self.delete_document(node_id, false)?;
        }
        self.kv.delete(ref_doc_id, &self.ref_doc_collection())?;
        self.kv.delete(ref_doc_id, &self.metadata_collection())?;
        self.kv.delete(ref_doc_id, &self.data_collection())?;
        debug!(ref_doc_id, nodes = info.node_ids.len(), "deleted ref doc");
        Ok(())
    }

    /// The [`RefDocInfo`] for a source document.
    pub fn get_ref_doc_info(&self, ref_doc_id: &str) -> Result<Option<RefDocInfo>> {
        self.kv
            .get(ref_doc_id, &self.ref_doc_collection())?
            .map(|v| serde_json::from_value(v).map_err(RagError::from))
            .transpose()
    }

    /// Every [`RefDocInfo`] keyed by source id.
    pub fn get_all_ref_doc_info(&self) -> Result<BTreeMap<String, RefDocInfo>> {
        self.kv
            .get_all(&self.ref_doc_collection())?
            .into_iter()
            .map(|(id, v)| Ok((id, serde_json::from_value(v)?)))
            .collect()
    }

    /// Whether a source document has any tracked nodes.
    pub fn ref_doc_exists(&self, ref_doc_id: &str) -> Result<bool> {
        Ok(self.get_ref_doc_info(ref_doc_id)?.is_some())
    }

    /// Record a hash for `id` (node or source document) without storing content.
    pub fn set_document_hash(&self, id: &str, hash: &str) -> Result<()> {
        let mut meta = self.node_metadata(id)?.unwrap_or_default();
        meta.doc_hash = hash.to_string();
        self.kv.put(id, serde_json::to_value(&meta)?, &self.metadata_collection())
    }

    /// The recorded hash for `id`.
    pub fn get_document_hash(&self, id: &str) -> Result<Option<String>> {
        Ok(self.node_metadata(id)?.map(|m| m.doc_hash))
    }

    /// Inverse map `hash -> id` over every recorded hash.
    pub fn get_all_document_hashes(&self) -> Result<BTreeMap<String, String>> {
        let mut hashes = BTreeMap::new();
        for (id, value) in self.kv.get_all(&self.metadata_collection())? {
            let meta: NodeMetadata = serde_json::from_value(value)?;
            hashes.insert(meta.doc_hash, id);
        }
        Ok(hashes)
    }

    /// Raw `metadata` collection record, for diagnostics.
    pub fn metadata_record(&self, id: &str) -> Result<Option<serde_json::Value>> {
        self.kv.get(id, &self.metadata_collection())
    }
}
