//! Token-bounded chat history over a [`ChatStore`].

use std::sync::Arc;

use tracing::debug;

use crate::models::{ChatMessage, MessageRole};
use crate::storage::{ChatStore, SimpleChatStore};

pub const DEFAULT_CHAT_STORE_KEY: &str = "chat_history";
pub const DEFAULT_TOKEN_LIMIT: usize = 3000;

/// Approximate token count: whitespace-separated words.
pub fn approx_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// The most recent messages of one conversation that fit a token budget.
#[derive(Clone)]
pub struct ChatMemoryBuffer {
    store: Arc<dyn ChatStore>,
    key: String,
    token_limit: usize,
}

impl ChatMemoryBuffer {
    pub fn new(store: Arc<dyn ChatStore>, key: impl Into<String>, token_limit: usize) -> Self {
        Self { store, key: key.into(), token_limit }
    }

    /// An in-memory buffer under [`DEFAULT_CHAT_STORE_KEY`].
    pub fn from_defaults(token_limit: usize) -> Self {
        Self::new(Arc::new(SimpleChatStore::new()), DEFAULT_CHAT_STORE_KEY, token_limit)
    }

    pub fn token_limit(&self) -> usize {
        self.token_limit
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Recent history within the token limit.
    pub fn get(&self) -> Vec<ChatMessage> {
        self.get_with_reserved(0)
    }

    /// Recent history within the token limit minus `reserved` tokens.
    ///
    /// The window never starts on an assistant or tool message, since those
    /// answer a turn that would be cut off.
    pub fn get_with_reserved(&self, reserved: usize) -> Vec<ChatMessage> {
        let messages = self.store.get_messages(&self.key);
        let budget = self.token_limit.saturating_sub(reserved);

        let mut start = messages.len();
        let mut used = 0;
        while start > 0 {
            let cost = approx_tokens(&messages[start - 1].content);
            if used + cost > budget {
                break;
            }
            used += cost;
            start -= 1;
        }
        while start < messages.len()
            && matches!(messages[start].role, MessageRole::Assistant | MessageRole::Tool)
        {
            start += 1;
        }
        debug!(key = %self.key, kept = messages.len() - start, tokens = used, "chat memory window");
        messages[start..].to_vec()
    }

    /// Every stored message, ignoring the limit.
    pub fn get_all(&self) -> Vec<ChatMessage> {
        self.store.get_messages(&self.key)
    }

    pub fn put(&self, message: ChatMessage) {
        self.store.add_message(&self.key, message);
    }

    pub fn set(&self, messages: Vec<ChatMessage>) {
        self.store.set_messages(&self.key, messages);
    }

    pub fn reset(&self) {
        self.store.delete_messages(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_fits_limit() {
        let memory = ChatMemoryBuffer::from_defaults(5);
        memory.put(ChatMessage::user("one two three"));
        memory.put(ChatMessage::assistant("four five"));
        memory.put(ChatMessage::user("six seven"));
        memory.put(ChatMessage::assistant("eight"));
        // the last three fit, but the window may not open on an assistant turn
        assert_eq!(
            memory.get(),
            vec![ChatMessage::user("six seven"), ChatMessage::assistant("eight")]
        );
        assert_eq!(memory.get_all().len(), 4);
    }

    #[test]
    fn reserved_tokens_shrink_window() {
        let memory = ChatMemoryBuffer::from_defaults(10);
        memory.put(ChatMessage::user("a b c"));
        memory.put(ChatMessage::user("d e f"));
        assert_eq!(memory.get().len(), 2);
        assert_eq!(memory.get_with_reserved(5), vec![ChatMessage::user("d e f")]);
    }

    #[test]
    fn shared_store_and_reset() {
        let store: Arc<dyn ChatStore> = Arc::new(SimpleChatStore::new());
        let a = ChatMemoryBuffer::new(store.clone(), "a", 100);
        let b = ChatMemoryBuffer::new(store.clone(), "b", 100);
        a.put(ChatMessage::user("hi"));
        b.put(ChatMessage::user("yo"));
        a.reset();
        assert!(a.get().is_empty());
        assert_eq!(b.get(), vec![ChatMessage::user("yo")]);
        assert_eq!(store.keys(), vec!["b"]);
    }
}
