//! External model interfaces: LLMs and embedding models, plus offline mocks.

pub mod embedding;
pub mod llm;
pub mod mock;

pub use embedding::{
    EmbeddingModel, checked_similarity, cosine_similarity, embed_nodes, mmr_by_similarity,
    top_k_by_similarity,
};
pub use llm::{
    ChatDelta, ChatMessage, ChatStream, Llm, LlmMetadata, MessageRole, TextStream,
    messages_to_prompt,
};
pub use mock::{MockEmbedding, MockLlm, MockResponse};
