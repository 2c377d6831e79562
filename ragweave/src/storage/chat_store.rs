//! Conversation history keyed by session.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use parking_lot::RwLock;

use crate::error::{RagError, Result};
use crate::models::ChatMessage;

/// Stores chat transcripts by key.
pub trait ChatStore: Send + Sync {
    /// Replace the transcript for `key`.
    fn set_messages(&self, key: &str, messages: Vec<ChatMessage>);

    fn get_messages(&self, key: &str) -> Vec<ChatMessage>;

    fn add_message(&self, key: &str, message: ChatMessage);

    /// Remove and return the whole transcript.
    fn delete_messages(&self, key: &str) -> Option<Vec<ChatMessage>>;

    /// Remove and return the message at `idx`.
    fn delete_message(&self, key: &str, idx: usize) -> Option<ChatMessage>;

    fn delete_last_message(&self, key: &str) -> Option<ChatMessage>;

    fn keys(&self) -> Vec<String>;
}

/// In-memory chat store with optional JSON persistence.
#[derive(Debug, Default)]
pub struct SimpleChatStore {
    store: RwLock<BTreeMap<String, Vec<ChatMessage>>>,
}

impl SimpleChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec(&*self.store.read())?)?;
        Ok(())
    }

    /// Load a store written by [`persist`](Self::persist). A missing file yields an empty store.
    pub fn from_persist_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let bytes = fs::read(path)?;
        let store = serde_json::from_slice(&bytes)
            .map_err(|e| RagError::Decode(format!("{}: {e}", path.display())))?;
        Ok(Self { store: RwLock::new(store) })
    }
}

impl ChatStore for SimpleChatStore {
    fn set_messages(&self, key: &str, messages: Vec<ChatMessage>) {
        self.store.write().insert(key.to_string(), messages);
    }

    fn get_messages(&self, key: &str) -> Vec<ChatMessage> {
        self.store.read().get(key).cloned().unwrap_or_default()
    }

    fn add_message(&self, key: &str, message: ChatMessage) {
        self.store.write().entry(key.to_string()).or_default().push(message);
    }

    fn delete_messages(&self, key: &str) -> Option<Vec<ChatMessage>> {
        self.store.write().remove(key)
    }

    fn delete_message(&self, key: &str, idx: usize) -> Option<ChatMessage> {
        let mut store = self.store.write();
        let messages = store.get_mut(key)?;
        (idx < messages.len()).then(|| messages.remove(idx))
    }

    fn delete_last_message(&self, key: &str) -> Option<ChatMessage> {
        self.store.write().get_mut(key)?.pop()
    }

    fn keys(&self) -> Vec<String> {
        self.store.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_lifecycle() {
        let store = SimpleChatStore::new();
        store.add_message("s", ChatMessage::user("hi"));
        store.add_message("s", ChatMessage::assistant("hello"));
        store.add_message("s", ChatMessage::user("bye"));
        assert_eq!(store.delete_message("s", 1), Some(ChatMessage::assistant("hello")));
        assert_eq!(store.delete_message("s", 9), None);
        assert_eq!(store.delete_last_message("s"), Some(ChatMessage::user("bye")));
        assert_eq!(store.get_messages("s"), vec![ChatMessage::user("hi")]);
        assert_eq!(store.keys(), vec!["s"]);
        assert!(store.delete_messages("s").is_some());
        assert!(store.get_messages("s").is_empty());
    }

    #[test]
    fn persists_to_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat_store.json");
        let store = SimpleChatStore::new();
        store.set_messages("a", vec![ChatMessage::system("be brief")]);
        store.persist(&path).unwrap();
        let loaded = SimpleChatStore::from_persist_path(&path).unwrap();
        assert_eq!(loaded.get_messages("a"), vec![ChatMessage::system("be brief")]);
    }
}
