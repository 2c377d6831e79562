//! Core data model: nodes, documents, queries and metadata filters.

mod filter;
mod node;
mod query;

pub use filter::{FilterCondition, FilterNode, FilterOperator, MetadataFilter, MetadataFilters};
pub use node::{
    Document, Metadata, MetadataMode, Node, NodeRelationship, NodeType, NodeWithScore,
    RelatedNode, RelatedNodeInfo, content_hash, json_to_node, node_to_json,
};
pub(crate) use node::value_to_text;
pub use query::QueryBundle;
