//! Large language model interface consumed by indexes, retrievers and selectors.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Instructions for the model.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Output of a tool call.
    Tool,
}

impl MessageRole {
    /// Lowercase role name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A single chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who produced the message.
    pub role: MessageRole,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Create a message.
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }

    /// System message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// User message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Tool output message.
    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Tool, content)
    }
}

/// One increment of a streamed chat response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatDelta {
    /// Newly generated text.
    pub delta: String,
    /// Set on the final delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Static facts about a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmMetadata {
    /// Model identifier.
    pub model_name: String,
    /// Maximum prompt plus completion tokens.
    pub context_window: usize,
    /// Tokens reserved for the completion.
    pub num_output: usize,
}

impl Default for LlmMetadata {
    fn default() -> Self {
        Self { model_name: "unknown".to_string(), context_window: 3900, num_output: 256 }
    }
}

/// Lazy, finite stream of completion deltas. Dropping it stops the producer.
pub type TextStream = BoxStream<'static, Result<String>>;

/// Lazy, finite stream of chat deltas. Dropping it stops the producer.
pub type ChatStream = BoxStream<'static, Result<ChatDelta>>;

/// A text-generation model.
///
/// Only [`complete`](Llm::complete) is required. The chat and streaming methods
/// default to single-shot adapters over it; providers with native support
/// should override them.
#[async_trait]
pub trait Llm: Send + Sync {
    /// Describe the model.
    fn metadata(&self) -> LlmMetadata {
        LlmMetadata::default()
    }

    /// Complete a prompt.
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Answer a conversation.
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        self.complete(&messages_to_prompt(messages)).await
    }

    /// Stream a completion.
    async fn stream(&self, prompt: &str) -> Result<TextStream> {
        let text = self.complete(prompt).await?;
        Ok(stream::once(async move { Ok(text) }).boxed())
    }

    /// Stream a chat answer.
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<ChatStream> {
        let text = self.chat(messages).await?;
        let delta = ChatDelta { delta: text, finish_reason: Some("stop".to_string()) };
        Ok(stream::once(async move { Ok(delta) }).boxed())
    }
}

/// Flatten a conversation into a completion prompt ending with an open assistant turn.
pub fn messages_to_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str(message.role.as_str());
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }
    prompt.push_str("assistant: ");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_ends_with_assistant_turn() {
        let prompt =
            messages_to_prompt(&[ChatMessage::system("be brief"), ChatMessage::user("hi")]);
        assert_eq!(prompt, "system: be brief\nuser: hi\nassistant: ");
    }
}
