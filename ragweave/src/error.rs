//! Error types for the `ragweave` crate.

use thiserror::Error;

/// Boxed error produced by an external collaborator (LLM, embedding model, vector backend).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in storage, indexing and retrieval operations.
#[derive(Debug, Error)]
pub enum RagError {
    /// A requested record does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// What kind of record was looked up (node, ref doc, index struct, ...).
        kind: &'static str,
        /// The identifier that missed.
        id: String,
    },

    /// An insert without `allow_update` collided with an existing record.
    #[error("'{id}' already exists")]
    AlreadyExists {
        /// The colliding identifier.
        id: String,
    },

    /// A lookup that expects a single match found several.
    #[error("Ambiguous lookup: {0}")]
    Ambiguous(String),

    /// A caller-supplied value is invalid (empty id, unknown mode, bad dimensions, ...).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not supported by this component.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Persisted or model-produced data could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A call to an LLM, embedding model or storage backend failed.
    #[error("Upstream error ({provider}): {source}")]
    Upstream {
        /// The collaborator that produced the error.
        provider: String,
        /// The underlying error, unchanged.
        #[source]
        source: BoxError,
    },

    /// The operation was cancelled through its cancellation handle.
    #[error("Operation cancelled")]
    Cancelled,

    /// Filesystem failure while loading or persisting stores.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RagError {
    /// Wrap an error raised by an external collaborator.
    pub fn upstream(provider: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Upstream { provider: provider.into(), source: source.into() }
    }

    /// Shorthand for a missing node.
    pub(crate) fn node_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { kind: "node", id: id.into() }
    }
}

impl From<serde_json::Error> for RagError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// A convenience result type for RAG operations.
pub type Result<T> = std::result::Result<T, RagError>;
