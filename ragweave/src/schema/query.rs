//! Query bundles passed to retrievers.

use serde::{Deserialize, Serialize};

use super::filter::MetadataFilters;

/// A query string with an optional precomputed embedding and metadata filter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryBundle {
    /// Natural-language query.
    pub query_str: String,
    /// Query embedding; retrievers compute it on demand when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Restricts results to nodes whose metadata matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<MetadataFilters>,
}

impl QueryBundle {
    /// Bundle a bare query string.
    pub fn new(query: impl Into<String>) -> Self {
        Self { query_str: query.into(), embedding: None, filters: None }
    }

    /// Attach a precomputed embedding.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Attach a metadata filter.
    pub fn with_filters(mut self, filters: MetadataFilters) -> Self {
        self.filters = Some(filters);
        self
    }
}

impl From<&str> for QueryBundle {
    fn from(query: &str) -> Self {
        Self::new(query)
    }
}

impl From<String> for QueryBundle {
    fn from(query: String) -> Self {
        Self::new(query)
    }
}
