//! Nodes, documents and scored retrieval results.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{RagError, Result};

/// Key-value metadata attached to nodes. Ordered so hashing is canonical.
pub type Metadata = BTreeMap<String, Value>;

/// The kind of content a [`Node`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Plain text chunk.
    #[default]
    Text,
    /// Image reference (text holds a caption or path).
    Image,
    /// A node that points at another index.
    Index,
    /// A pre-chunk source document.
    Document,
}

impl NodeType {
    /// The envelope tag used when persisting.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Index => "index",
            Self::Document => "document",
        }
    }
}

/// Role of a related node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRelationship {
    /// The document this node was derived from.
    Source,
    /// The preceding sibling chunk.
    Previous,
    /// The following sibling chunk.
    Next,
    /// The enclosing coarser chunk.
    Parent,
    /// Finer chunks nested inside this one.
    Child,
}

/// A lightweight descriptor of another node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedNodeInfo {
    /// The related node's identifier.
    pub node_id: String,
    /// The related node's type, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<NodeType>,
    /// Metadata snapshot of the related node.
    #[serde(default)]
    pub metadata: Metadata,
    /// Hash of the related node at the time the link was made.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl RelatedNodeInfo {
    /// Descriptor carrying only an id.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self { node_id: node_id.into(), node_type: None, metadata: Metadata::new(), hash: None }
    }
}

/// Value of one relationship entry: a single node, or a list for [`NodeRelationship::Child`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelatedNode {
    /// A single related node.
    One(RelatedNodeInfo),
    /// Several related nodes.
    Many(Vec<RelatedNodeInfo>),
}

impl RelatedNode {
    /// All descriptors in this entry.
    pub fn infos(&self) -> Vec<&RelatedNodeInfo> {
        match self {
            Self::One(info) => vec![info],
            Self::Many(infos) => infos.iter().collect(),
        }
    }
}

/// Which metadata keys to include when rendering node content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetadataMode {
    /// Every metadata key.
    All,
    /// Keys not excluded for embedding.
    Embed,
    /// Keys not excluded for the LLM.
    Llm,
    /// Text only.
    #[default]
    None,
}

/// The fundamental storage unit: a chunk of text with metadata and relationships.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable identifier.
    pub id: String,
    /// Content text.
    pub text: String,
    /// Content kind.
    #[serde(rename = "type", default)]
    pub node_type: NodeType,
    /// Arbitrary metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Dense embedding, when computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Hash of `(text, metadata)`.
    #[serde(default)]
    pub hash: String,
    /// Links to related nodes.
    #[serde(default)]
    pub relationships: BTreeMap<NodeRelationship, RelatedNode>,
    /// Metadata keys hidden from embedding text.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_embed_metadata_keys: Vec<String>,
    /// Metadata keys hidden from LLM text.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_llm_metadata_keys: Vec<String>,
    /// For [`NodeType::Index`] nodes, the index they point at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_id: Option<String>,
}

impl Node {
    /// Create a text node with a generated id.
    pub fn new(text: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), text)
    }

    /// Create a text node with an explicit id.
    pub fn with_id(id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut node = Self {
            id: id.into(),
            text: text.into(),
            node_type: NodeType::Text,
            metadata: Metadata::new(),
            embedding: None,
            hash: String::new(),
            relationships: BTreeMap::new(),
            excluded_embed_metadata_keys: Vec::new(),
            excluded_llm_metadata_keys: Vec::new(),
            index_id: None,
        };
        node.refresh_hash();
        node
    }

    /// Add a metadata entry and rehash.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self.refresh_hash();
        self
    }

    /// Attach an embedding.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Set a single-valued relationship.
    pub fn with_relationship(mut self, role: NodeRelationship, info: RelatedNodeInfo) -> Self {
        self.set_relationship(role, info);
        self
    }

    /// Set a single-valued relationship in place. `Child` entries accumulate.
    pub fn set_relationship(&mut self, role: NodeRelationship, info: RelatedNodeInfo) {
        if role == NodeRelationship::Child {
            let mut infos = match self.relationships.remove(&role) {
                Some(RelatedNode::Many(infos)) => infos,
                Some(RelatedNode::One(prev)) => vec![prev],
                None => Vec::new(),
            };
            infos.push(info);
            self.relationships.insert(role, RelatedNode::Many(infos));
        } else {
            self.relationships.insert(role, RelatedNode::One(info));
        }
    }

    /// Replace the child list.
    pub fn set_children(&mut self, children: Vec<RelatedNodeInfo>) {
        self.relationships.insert(NodeRelationship::Child, RelatedNode::Many(children));
    }

    /// Recompute [`Node::hash`] from the current text and metadata.
    pub fn refresh_hash(&mut self) {
        self.hash = content_hash(&self.text, &self.metadata);
    }

    /// Replace the text and rehash.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.refresh_hash();
    }

    fn single(&self, role: NodeRelationship) -> Option<&RelatedNodeInfo> {
        match self.relationships.get(&role)? {
            RelatedNode::One(info) => Some(info),
            RelatedNode::Many(infos) => infos.first(),
        }
    }

    /// The source document link.
    pub fn source(&self) -> Option<&RelatedNodeInfo> {
        self.single(NodeRelationship::Source)
    }

    /// The source document id, if any.
    pub fn ref_doc_id(&self) -> Option<&str> {
        self.source().map(|info| info.node_id.as_str())
    }

    /// The preceding sibling link.
    pub fn prev(&self) -> Option<&RelatedNodeInfo> {
        self.single(NodeRelationship::Previous)
    }

    /// The following sibling link.
    pub fn next(&self) -> Option<&RelatedNodeInfo> {
        self.single(NodeRelationship::Next)
    }

    /// The parent link.
    pub fn parent(&self) -> Option<&RelatedNodeInfo> {
        self.single(NodeRelationship::Parent)
    }

    /// The child links (empty for leaves).
    pub fn children(&self) -> Vec<&RelatedNodeInfo> {
        self.relationships.get(&NodeRelationship::Child).map(RelatedNode::infos).unwrap_or_default()
    }

    /// A descriptor pointing at this node.
    pub fn as_related_info(&self) -> RelatedNodeInfo {
        RelatedNodeInfo {
            node_id: self.id.clone(),
            node_type: Some(self.node_type),
            metadata: self.metadata.clone(),
            hash: Some(self.hash.clone()),
        }
    }

    /// The embedding, or an error if none has been computed.
    pub fn embedding(&self) -> Result<&[f32]> {
        self.embedding
            .as_deref()
            .ok_or_else(|| {
                RagError::InvalidArgument(format!("node '{}' has no embedding", self.id))
            })
    }

    /// Metadata rendered as `key: value` lines for the given mode.
    pub fn metadata_str(&self, mode: MetadataMode) -> String {
        let excluded: &[String] = match mode {
            MetadataMode::None => return String::new(),
            MetadataMode::All => &[],
            MetadataMode::Embed => &self.excluded_embed_metadata_keys,
            MetadataMode::Llm => &self.excluded_llm_metadata_keys,
        };
        self.metadata
            .iter()
            .filter(|(key, _)| !excluded.contains(key))
            .map(|(key, value)| format!("{key}: {}", value_to_text(value)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Text prefixed with the metadata selected by `mode`.
    pub fn content(&self, mode: MetadataMode) -> String {
        let meta = self.metadata_str(mode);
        if meta.is_empty() { self.text.clone() } else { format!("{meta}\n\n{}", self.text) }
    }
}

/// Render a metadata value without JSON quoting for plain strings.
pub(crate) fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Deterministic SHA-256 over text and canonical metadata.
pub fn content_hash(text: &str, metadata: &Metadata) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(b"\0");
    // BTreeMap keys serialize in sorted order, nested objects too
    hasher.update(serde_json::to_string(metadata).unwrap_or_default().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A pre-chunk source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// External source identifier; becomes the `Source` target of derived nodes.
    pub id: String,
    /// Full text.
    pub text: String,
    /// Metadata inherited by derived nodes.
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    /// Create a document.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self { id: id.into(), text: text.into(), metadata: Metadata::new() }
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Hash of `(text, metadata)`; used to detect changed sources on refresh.
    pub fn hash(&self) -> String {
        content_hash(&self.text, &self.metadata)
    }

    /// The document as a node of type [`NodeType::Document`].
    pub fn to_node(&self) -> Node {
        let mut node = Node::with_id(self.id.clone(), self.text.clone());
        node.node_type = NodeType::Document;
        node.metadata = self.metadata.clone();
        node.refresh_hash();
        node
    }

    /// Descriptor used as the `Source` relationship of derived nodes.
    pub fn as_related_info(&self) -> RelatedNodeInfo {
        RelatedNodeInfo {
            node_id: self.id.clone(),
            node_type: Some(NodeType::Document),
            metadata: self.metadata.clone(),
            hash: Some(self.hash()),
        }
    }
}

/// A node paired with a retriever-specific relevance score (higher is better).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeWithScore {
    /// The retrieved node.
    pub node: Node,
    /// Relevance score. Scales differ between retrievers.
    pub score: f32,
}

impl NodeWithScore {
    /// Pair a node with a score.
    pub fn new(node: Node, score: f32) -> Self {
        Self { node, score }
    }

    /// Shorthand for the node id.
    pub fn id(&self) -> &str {
        &self.node.id
    }
}

impl fmt::Display for NodeWithScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:.4}] {}: {}", self.score, self.node.id, self.node.text)
    }
}

/// Serialize a node into its persisted `{__type__, __data__}` envelope.
pub fn node_to_json(node: &Node) -> Result<Value> {
    Ok(serde_json::json!({
        "__type__": node.node_type.as_str(),
        "__data__": serde_json::to_value(node)?,
    }))
}

/// Decode a persisted node envelope.
pub fn json_to_node(value: Value) -> Result<Node> {
    let Value::Object(mut map) = value else {
        return Err(RagError::Decode("node envelope must be an object".to_string()));
    };
    let data = map
        .remove("__data__")
        .ok_or_else(|| RagError::Decode("node envelope missing '__data__'".to_string()))?;
    let mut node: Node = serde_json::from_value(data)?;
    if let Some(tag) = map.get("__type__").and_then(Value::as_str) {
        node.node_type = serde_json::from_value(Value::String(tag.to_string()))?;
    }
    Ok(node)
}
