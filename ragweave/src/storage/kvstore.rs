//! Namespaced key-value stores underlying the document and index stores.
//!
//! A store is a map of collections, each collection a map from string key to a
//! JSON [`StoredValue`]. Reads hand out clones, so callers can never mutate the
//! stored copy.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{RagError, Result};

/// A JSON record kept in a collection.
pub type StoredValue = serde_json::Value;

/// Collection used when the caller passes an empty name.
pub const DEFAULT_COLLECTION: &str = "data";

/// Every collection of a store: `collection -> key -> value`.
pub type KvData = BTreeMap<String, BTreeMap<String, StoredValue>>;

fn collection_name(collection: &str) -> &str {
    if collection.is_empty() { DEFAULT_COLLECTION } else { collection }
}

/// A namespaced key-value store.
pub trait KvStore: Send + Sync {
    /// Insert or replace `key` in `collection`, creating the collection if needed.
    fn put(&self, key: &str, value: StoredValue, collection: &str) -> Result<()>;

    /// Insert many entries. The default calls [`put`](KvStore::put) per entry.
    fn put_all(&self, entries: Vec<(String, StoredValue)>, collection: &str) -> Result<()> {
        for (key, value) in entries {
            self.put(&key, value, collection)?;
        }
        Ok(())
    }

    /// Fetch a copy of `key` from `collection`.
    fn get(&self, key: &str, collection: &str) -> Result<Option<StoredValue>>;

    /// Fetch a copy of every entry in `collection`.
    fn get_all(&self, collection: &str) -> Result<BTreeMap<String, StoredValue>>;

    /// Remove `key` from `collection`; returns whether something was removed.
    fn delete(&self, key: &str, collection: &str) -> Result<bool>;

    /// Write the whole store to `path` as one JSON document.
    fn persist(&self, path: &Path) -> Result<()>;
}

fn write_json(path: &Path, data: &KvData) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec(data)?;
    fs::write(path, bytes)?;
    Ok(())
}

fn read_json(path: &Path) -> Result<KvData> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| RagError::Decode(format!("{}: {e}", path.display())))
}

/// In-memory store guarded by a read-write lock.
///
/// # Example
///
/// ```rust,ignore
/// use ragweave::storage::{KvStore, SimpleKvStore};
///
/// let store = SimpleKvStore::new();
/// store.put("k", serde_json::json!({"a": 1}), "")?;
/// assert!(store.get("k", "data")?.is_some());
/// ```
#[derive(Debug, Default)]
pub struct SimpleKvStore {
    data: RwLock<KvData>,
}

impl SimpleKvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a dump produced by [`to_dict`](Self::to_dict).
    pub fn from_dict(data: KvData) -> Self {
        Self { data: RwLock::new(data) }
    }

    /// Dump every collection.
    pub fn to_dict(&self) -> KvData {
        self.data.read().clone()
    }

    /// Load a store persisted with [`KvStore::persist`]. A missing file yields an empty store.
    pub fn from_persist_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no persisted kv store, starting empty");
            return Ok(Self::new());
        }
        Ok(Self::from_dict(read_json(path)?))
    }
}

impl KvStore for SimpleKvStore {
    fn put(&self, key: &str, value: StoredValue, collection: &str) -> Result<()> {
        self.data
            .write()
            .entry(collection_name(collection).to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn put_all(&self, entries: Vec<(String, StoredValue)>, collection: &str) -> Result<()> {
        let mut data = self.data.write();
        let target = data.entry(collection_name(collection).to_string()).or_default();
        target.extend(entries);
        Ok(())
    }

    fn get(&self, key: &str, collection: &str) -> Result<Option<StoredValue>> {
        Ok(self.data.read().get(collection_name(collection)).and_then(|c| c.get(key)).cloned())
    }

    fn get_all(&self, collection: &str) -> Result<BTreeMap<String, StoredValue>> {
        Ok(self.data.read().get(collection_name(collection)).cloned().unwrap_or_default())
    }

    fn delete(&self, key: &str, collection: &str) -> Result<bool> {
        Ok(self
            .data
            .write()
            .get_mut(collection_name(collection))
            .is_some_and(|c| c.remove(key).is_some()))
    }

    fn persist(&self, path: &Path) -> Result<()> {
        let data = self.data.read();
        write_json(path, &data)
    }
}

/// File-backed store: loads on open and rewrites the whole file on every mutation.
///
/// Safe for a single writer process; the file is replaced in one write call under
/// the store's write lock.
#[derive(Debug)]
pub struct FileKvStore {
    path: PathBuf,
    data: RwLock<KvData>,
}

impl FileKvStore {
    /// Open (or create on first write) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Decode`] if an existing file is not a valid dump.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() { read_json(&path)? } else { KvData::new() };
        Ok(Self { path, data: RwLock::new(data) })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KvStore for FileKvStore {
    fn put(&self, key: &str, value: StoredValue, collection: &str) -> Result<()> {
        let mut data = self.data.write();
        data.entry(collection_name(collection).to_string())
            .or_default()
            .insert(key.to_string(), value);
        write_json(&self.path, &data)
    }

    fn put_all(&self, entries: Vec<(String, StoredValue)>, collection: &str) -> Result<()> {
        let mut data = self.data.write();
        data.entry(collection_name(collection).to_string()).or_default().extend(entries);
        write_json(&self.path, &data)
    }

    fn get(&self, key: &str, collection: &str) -> Result<Option<StoredValue>> {
        Ok(self.data.read().get(collection_name(collection)).and_then(|c| c.get(key)).cloned())
    }

    fn get_all(&self, collection: &str) -> Result<BTreeMap<String, StoredValue>> {
        Ok(self.data.read().get(collection_name(collection)).cloned().unwrap_or_default())
    }

    fn delete(&self, key: &str, collection: &str) -> Result<bool> {
        let mut data = self.data.write();
        let removed =
            data.get_mut(collection_name(collection)).is_some_and(|c| c.remove(key).is_some());
        if removed {
            write_json(&self.path, &data)?;
        }
        Ok(removed)
    }

    fn persist(&self, path: &Path) -> Result<()> {
        let data = self.data.read();
        write_json(path, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_collection_defaults_to_data() {
        let store = SimpleKvStore::new();
        store.put("k", json!(1), "").unwrap();
        assert_eq!(store.get("k", DEFAULT_COLLECTION).unwrap(), Some(json!(1)));
        assert!(store.to_dict().contains_key("data"));
    }

    #[test]
    fn returned_values_are_copies() {
        let store = SimpleKvStore::new();
        store.put("k", json!({"a": 1}), "c").unwrap();
        let mut copy = store.get("k", "c").unwrap().unwrap();
        copy["a"] = json!(2);
        assert_eq!(store.get("k", "c").unwrap().unwrap()["a"], json!(1));
    }

    #[test]
    fn delete_reports_presence() {
        let store = SimpleKvStore::new();
        store.put("k", json!(true), "c").unwrap();
        assert!(store.delete("k", "c").unwrap());
        assert!(!store.delete("k", "c").unwrap());
        assert!(!store.delete("k", "missing").unwrap());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/kv.json");
        {
            let store = FileKvStore::open(&path).unwrap();
            store.put("a", json!("x"), "c").unwrap();
            store.put("b", json!("y"), "c").unwrap();
            store.delete("b", "c").unwrap();
        }
        let reopened = FileKvStore::open(&path).unwrap();
        assert_eq!(reopened.get("a", "c").unwrap(), Some(json!("x")));
        assert_eq!(reopened.get("b", "c").unwrap(), None);
    }

    #[test]
    fn corrupt_file_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(FileKvStore::open(&path), Err(RagError::Decode(_))));
        assert!(matches!(SimpleKvStore::from_persist_path(&path), Err(RagError::Decode(_))));
    }
}
