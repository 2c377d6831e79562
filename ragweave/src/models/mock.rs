//! Deterministic offline models used as defaults and in tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{RagError, Result};

use super::embedding::EmbeddingModel;
use super::llm::{Llm, LlmMetadata};

/// What a [`MockLlm`] answers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    /// Return the prompt unchanged.
    Echo,
    /// Always return the same text.
    Fixed(String),
    /// Cycle through the given answers.
    Script(Vec<String>),
    /// Fail every call with an upstream error.
    Fail(String),
}

/// An LLM that never leaves the process.
#[derive(Debug)]
pub struct MockLlm {
    response: MockResponse,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new(MockResponse::Echo)
    }
}

impl MockLlm {
    /// Create a mock with the given behaviour.
    pub fn new(response: MockResponse) -> Self {
        Self { response, calls: AtomicUsize::new(0), prompts: Mutex::new(Vec::new()) }
    }

    /// Always answer `text`.
    pub fn fixed(text: impl Into<String>) -> Self {
        Self::new(MockResponse::Fixed(text.into()))
    }

    /// Answer with `answers` in order, wrapping around.
    pub fn script<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(MockResponse::Script(answers.into_iter().map(Into::into).collect()))
    }

    /// Fail every call.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::new(MockResponse::Fail(message.into()))
    }

    /// Number of completed calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl Llm for MockLlm {
    fn metadata(&self) -> LlmMetadata {
        LlmMetadata { model_name: "mock".to_string(), ..LlmMetadata::default() }
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());
        match &self.response {
            MockResponse::Echo => Ok(prompt.to_string()),
            MockResponse::Fixed(text) => Ok(text.clone()),
            MockResponse::Script(answers) if answers.is_empty() => Ok(String::new()),
            MockResponse::Script(answers) => Ok(answers[n % answers.len()].clone()),
            MockResponse::Fail(message) => Err(RagError::upstream("mock-llm", message.clone())),
        }
    }
}

/// Hashed bag-of-words embedding: texts sharing words get similar vectors.
#[derive(Debug, Clone, Copy)]
pub struct MockEmbedding {
    dimensions: usize,
}

impl Default for MockEmbedding {
    fn default() -> Self {
        Self::new(64)
    }
}

impl MockEmbedding {
    /// Create a model producing vectors of `dimensions` components.
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions: dimensions.max(1) }
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            let bucket = fnv1a(word.to_lowercase().as_bytes()) % self.dimensions as u64;
            vector[bucket as usize] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325u64, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[async_trait]
impl EmbeddingModel for MockEmbedding {
    async fn text_embedding(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
