//! Splitting documents into nodes.
//!
//! - [`SentenceSplitter`]: paragraphs, then sentences, then words, with overlap
//! - [`HierarchicalNodeParser`]: several chunk sizes linked by parent/child relationships

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::schema::{Document, Node, NodeRelationship};
use crate::settings::Settings;

const SEPARATORS: [&str; 5] = ["\n\n", ". ", "! ", "? ", " "];
const CHUNK_INDEX_KEY: &str = "chunk_index";

/// Turns documents into nodes.
pub trait NodeParser: Send + Sync {
    /// Split every document. Empty documents yield no nodes.
    fn get_nodes_from_documents(&self, documents: &[Document]) -> Vec<Node>;
}

/// Chunking parameters, in characters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitterConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::settings::DEFAULT_CHUNK_SIZE,
            chunk_overlap: crate::settings::DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl SplitterConfig {
    pub fn builder() -> SplitterConfigBuilder {
        SplitterConfigBuilder::default()
    }
}

/// Builder for a validated [`SplitterConfig`].
#[derive(Debug, Clone, Default)]
pub struct SplitterConfigBuilder {
    config: SplitterConfig,
}

impl SplitterConfigBuilder {
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    pub fn chunk_overlap(mut self, overlap: usize) -> Self {
        self.config.chunk_overlap = overlap;
        self
    }

    /// # Errors
    ///
    /// Returns [`RagError::InvalidArgument`] if `chunk_size == 0` or
    /// `chunk_overlap >= chunk_size`.
    pub fn build(self) -> Result<SplitterConfig> {
        if self.config.chunk_size == 0 {
            return Err(RagError::InvalidArgument("chunk_size must be greater than zero".into()));
        }
        if self.config.chunk_overlap >= self.config.chunk_size {
            return Err(RagError::InvalidArgument(format!(
                "chunk_overlap ({}) must be less than chunk_size ({})",
                self.config.chunk_overlap, self.config.chunk_size
            )));
        }
        Ok(self.config)
    }
}

/// Splits text hierarchically: paragraphs, sentences, then words.
///
/// Node ids are `{document_id}_{chunk_index}`. Each node inherits the document's
/// metadata plus a `chunk_index` entry hidden from embedding and LLM text, links
/// to its document through `Source`, and to its neighbours through
/// `Previous`/`Next`.
///
/// # Example
///
/// ```rust,ignore
/// use ragweave::node_parser::{NodeParser, SentenceSplitter, SplitterConfig};
///
/// let splitter = SentenceSplitter::new(SplitterConfig::builder().chunk_size(512).build()?);
/// let nodes = splitter.get_nodes_from_documents(&documents);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SentenceSplitter {
    config: SplitterConfig,
}

impl SentenceSplitter {
    pub fn new(config: SplitterConfig) -> Self {
        Self { config }
    }

    /// Splitter using the chunk size and overlap in `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(SplitterConfig {
            chunk_size: settings.chunk_size.max(1),
            chunk_overlap: settings.chunk_overlap.min(settings.chunk_size.saturating_sub(1)),
        })
    }

    /// Split raw text into chunk strings.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        split_and_merge(text, self.config.chunk_size, self.config.chunk_overlap, &SEPARATORS)
            .into_iter()
            .map(|chunk| chunk.trim().to_string())
            .filter(|chunk| !chunk.is_empty())
            .collect()
    }

    fn split_document(&self, document: &Document, id_prefix: &str) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .split_text(&document.text)
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                let mut node = Node::with_id(format!("{id_prefix}_{i}"), text);
                node.metadata = document.metadata.clone();
                node.metadata.insert(CHUNK_INDEX_KEY.to_string(), i.into());
                node.excluded_embed_metadata_keys.push(CHUNK_INDEX_KEY.to_string());
                node.excluded_llm_metadata_keys.push(CHUNK_INDEX_KEY.to_string());
                node.refresh_hash();
                node.set_relationship(NodeRelationship::Source, document.as_related_info());
                node
            })
            .collect();
        link_siblings(&mut nodes);
        nodes
    }
}

impl NodeParser for SentenceSplitter {
    fn get_nodes_from_documents(&self, documents: &[Document]) -> Vec<Node> {
        documents.iter().flat_map(|doc| self.split_document(doc, &doc.id)).collect()
    }
}

fn link_siblings(nodes: &mut [Node]) {
    for i in 1..nodes.len() {
        let prev = nodes[i - 1].as_related_info();
        let next = nodes[i].as_related_info();
        nodes[i].set_relationship(NodeRelationship::Previous, prev);
        nodes[i - 1].set_relationship(NodeRelationship::Next, next);
    }
}

/// Split text by a separator, then merge segments into chunks that respect
/// `chunk_size`. Oversized segments are split with the next separator.
fn split_and_merge(
    text: &str,
    chunk_size: usize,
    chunk_overlap: usize,
    separators: &[&str],
) -> Vec<String> {
    if text.len() <= chunk_size {
        return vec![text.to_string()];
    }
    let Some((&separator, remaining_separators)) = separators.split_first() else {
        return split_by_size(text, chunk_size, chunk_overlap);
    };

    let mut pieces: Vec<String> = Vec::new();
    for segment in split_keeping_separator(text, separator) {
        if segment.len() > chunk_size {
            let nested = split_and_merge(segment, chunk_size, chunk_overlap, remaining_separators);
            pieces.extend(nested);
        } else {
            pieces.push(segment.to_string());
        }
    }
    merge_with_overlap(pieces, chunk_size, chunk_overlap)
}

/// Greedily pack pieces into chunks, seeding each new chunk with trailing
/// pieces of the previous one that fit in `chunk_overlap`.
fn merge_with_overlap(pieces: Vec<String>, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_len = 0;

    for piece in pieces {
        if current_len + piece.len() > chunk_size && !current.is_empty() {
            chunks.push(current.concat());
            let mut tail: Vec<String> = Vec::new();
            let mut tail_len = 0;
            for prev in current.iter().rev() {
                if tail_len + prev.len() > chunk_overlap {
                    break;
                }
                tail_len += prev.len();
                tail.push(prev.clone());
            }
            tail.reverse();
            if tail_len + piece.len() > chunk_size {
                tail.clear();
                tail_len = 0;
            }
            current = tail;
            current_len = tail_len;
        }
        current_len += piece.len();
        current.push(piece);
    }
    if !current.is_empty() {
        chunks.push(current.concat());
    }
    chunks
}

/// Split text at a separator while keeping the separator attached to the preceding segment.
fn split_keeping_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    let mut result = Vec::new();
    let mut start = 0;

    while let Some(pos) = text[start..].find(separator) {
        let end = start + pos + separator.len();
        result.push(&text[start..end]);
        start = end;
    }

    if start < text.len() {
        result.push(&text[start..]);
    }

    result
}

/// Character-based splitting with overlap; never cuts inside a UTF-8 sequence.
fn split_by_size(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;
    let step = chunk_size.saturating_sub(chunk_overlap).max(1);

    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }

    chunks
}

/// Default chunk sizes for [`HierarchicalNodeParser`], coarsest first.
pub const DEFAULT_HIERARCHY: [usize; 3] = [2048, 512, 128];

/// Splits documents at several granularities.
///
/// Every node of level `n + 1` is cut out of a level-`n` node and linked to it
/// through `Parent`; the coarser node lists its pieces under `Child`. Siblings
/// at each level are chained through `Previous`/`Next`.
#[derive(Debug, Clone)]
pub struct HierarchicalNodeParser {
    chunk_sizes: Vec<usize>,
    chunk_overlap: usize,
}

impl Default for HierarchicalNodeParser {
    fn default() -> Self {
        Self { chunk_sizes: DEFAULT_HIERARCHY.to_vec(), chunk_overlap: 20 }
    }
}

impl HierarchicalNodeParser {
    /// # Errors
    ///
    /// Returns [`RagError::InvalidArgument`] if `chunk_sizes` is empty, or any size is
    /// not larger than `chunk_overlap`.
    pub fn new(chunk_sizes: Vec<usize>, chunk_overlap: usize) -> Result<Self> {
        if chunk_sizes.is_empty() {
            return Err(RagError::InvalidArgument("chunk_sizes must not be empty".into()));
        }
        if let Some(size) = chunk_sizes.iter().find(|&&s| s <= chunk_overlap) {
            return Err(RagError::InvalidArgument(format!(
                "chunk size {size} must exceed overlap {chunk_overlap}"
            )));
        }
        Ok(Self { chunk_sizes, chunk_overlap })
    }

    fn split_level(&self, parents: &mut [Node], size: usize, document: &Document) -> Vec<Node> {
        let splitter = SentenceSplitter::new(SplitterConfig {
            chunk_size: size,
            chunk_overlap: self.chunk_overlap,
        });
        let mut level = Vec::new();
        for parent in parents.iter_mut() {
            let piece = Document {
                id: parent.id.clone(),
                text: parent.text.clone(),
                metadata: document.metadata.clone(),
            };
            let mut children = splitter.split_document(&piece, &parent.id);
            for child in &mut children {
                child.set_relationship(NodeRelationship::Source, document.as_related_info());
                child.set_relationship(NodeRelationship::Parent, parent.as_related_info());
            }
            parent.set_children(children.iter().map(Node::as_related_info).collect());
            level.extend(children);
        }
        level
    }
}

impl NodeParser for HierarchicalNodeParser {
    fn get_nodes_from_documents(&self, documents: &[Document]) -> Vec<Node> {
        let mut out = Vec::new();
        for document in documents {
            let Some((&top, finer)) = self.chunk_sizes.split_first() else {
                continue;
            };
            let top_splitter = SentenceSplitter::new(SplitterConfig {
                chunk_size: top,
                chunk_overlap: self.chunk_overlap,
            });
            let mut level = top_splitter.split_document(document, &document.id);
            for &size in finer {
                let mut next = self.split_level(&mut level, size, document);
                link_siblings(&mut next);
                out.append(&mut level);
                level = next;
            }
            out.append(&mut level);
        }
        out
    }
}

/// Nodes without children.
pub fn get_leaf_nodes(nodes: &[Node]) -> Vec<Node> {
    nodes.iter().filter(|n| n.children().is_empty()).cloned().collect()
}

/// Nodes without a parent.
pub fn get_root_nodes(nodes: &[Node]) -> Vec<Node> {
    nodes.iter().filter(|n| n.parent().is_none()).cloned().collect()
}
