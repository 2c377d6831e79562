//! Process-wide defaults for models and chunking.
//!
//! [`Settings`] is a plain cloneable value. Components take one explicitly; the
//! global copy behind [`Settings::global`] only seeds callers that do not care.

use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::error::{RagError, Result};
use crate::models::{EmbeddingModel, Llm, MockEmbedding, MockLlm};

/// Default chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;
/// Default overlap between consecutive chunks in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

static GLOBAL: OnceLock<RwLock<Settings>> = OnceLock::new();

/// Models and chunking parameters shared by indexes and retrievers.
#[derive(Clone)]
pub struct Settings {
    /// LLM used for summaries, extraction and selection.
    pub llm: Arc<dyn Llm>,
    /// Embedding model used for dense retrieval.
    pub embed_model: Arc<dyn EmbeddingModel>,
    /// Chunk size for the default node parser.
    pub chunk_size: usize,
    /// Chunk overlap for the default node parser.
    pub chunk_overlap: usize,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("llm", &self.llm.metadata().model_name)
            .field("embed_dimensions", &self.embed_model.dimensions())
            .field("chunk_size", &self.chunk_size)
            .field("chunk_overlap", &self.chunk_overlap)
            .finish()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm: Arc::new(MockLlm::default()),
            embed_model: Arc::new(MockEmbedding::default()),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl Settings {
    /// Create a builder starting from the defaults.
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }

    /// Snapshot of the process-wide settings, initialised to defaults on first use.
    pub fn global() -> Settings {
        GLOBAL.get_or_init(|| RwLock::new(Settings::default())).read().clone()
    }

    /// Replace the process-wide settings.
    pub fn set_global(settings: Settings) {
        *GLOBAL.get_or_init(|| RwLock::new(Settings::default())).write() = settings;
    }

    /// Mutate the process-wide settings in place.
    pub fn update_global(f: impl FnOnce(&mut Settings)) {
        f(&mut GLOBAL.get_or_init(|| RwLock::new(Settings::default())).write());
    }

    /// Return a copy with a different LLM.
    pub fn with_llm(mut self, llm: Arc<dyn Llm>) -> Self {
        self.llm = llm;
        self
    }

    /// Return a copy with a different embedding model.
    pub fn with_embed_model(mut self, embed_model: Arc<dyn EmbeddingModel>) -> Self {
        self.embed_model = embed_model;
        self
    }
}

/// Builder for a validated [`Settings`].
#[derive(Default)]
pub struct SettingsBuilder {
    settings: Option<Settings>,
    llm: Option<Arc<dyn Llm>>,
    embed_model: Option<Arc<dyn EmbeddingModel>>,
    chunk_size: Option<usize>,
    chunk_overlap: Option<usize>,
}

impl SettingsBuilder {
    /// Start from an existing value instead of the defaults.
    pub fn base(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Set the LLM.
    pub fn llm(mut self, llm: Arc<dyn Llm>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Set the embedding model.
    pub fn embed_model(mut self, embed_model: Arc<dyn EmbeddingModel>) -> Self {
        self.embed_model = Some(embed_model);
        self
    }

    /// Set the chunk size.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size);
        self
    }

    /// Set the chunk overlap.
    pub fn chunk_overlap(mut self, overlap: usize) -> Self {
        self.chunk_overlap = Some(overlap);
        self
    }

    /// Build the [`Settings`].
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidArgument`] if `chunk_overlap >= chunk_size`.
    pub fn build(self) -> Result<Settings> {
        let mut settings = self.settings.unwrap_or_default();
        if let Some(llm) = self.llm {
            settings.llm = llm;
        }
        if let Some(embed_model) = self.embed_model {
            settings.embed_model = embed_model;
        }
        if let Some(size) = self.chunk_size {
            settings.chunk_size = size;
        }
        if let Some(overlap) = self.chunk_overlap {
            settings.chunk_overlap = overlap;
        }
        if settings.chunk_overlap >= settings.chunk_size {
            return Err(RagError::InvalidArgument(format!(
                "chunk_overlap ({}) must be less than chunk_size ({})",
                settings.chunk_overlap, settings.chunk_size
            )));
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_overlap_not_below_size() {
        let err = Settings::builder().chunk_size(100).chunk_overlap(100).build().unwrap_err();
        assert!(matches!(err, RagError::InvalidArgument(_)));
        let ok = Settings::builder().chunk_size(100).chunk_overlap(10).build().unwrap();
        assert_eq!(ok.chunk_size, 100);
    }

    #[test]
    fn global_updates_are_visible() {
        Settings::update_global(|s| s.chunk_size = 777);
        assert_eq!(Settings::global().chunk_size, 777);
        Settings::set_global(Settings::default());
        assert_eq!(Settings::global().chunk_size, DEFAULT_CHUNK_SIZE);
    }
}
