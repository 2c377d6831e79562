//! Persistence of [`IndexStruct`] descriptors over a [`KvStore`].

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::data_structs::IndexStruct;
use crate::error::{RagError, Result};

use super::kvstore::{KvStore, SimpleKvStore};

/// Namespace used when none is given.
pub const DEFAULT_INDEX_STORE_NAMESPACE: &str = "index_store";

/// Index struct store keyed by index id.
#[derive(Clone)]
pub struct IndexStore {
    kv: Arc<dyn KvStore>,
    namespace: String,
}

impl fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexStore").field("namespace", &self.namespace).finish_non_exhaustive()
    }
}

impl Default for IndexStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl IndexStore {
    pub fn new(kv: Arc<dyn KvStore>, namespace: impl Into<String>) -> Self {
        Self { kv, namespace: namespace.into() }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(SimpleKvStore::new()), DEFAULT_INDEX_STORE_NAMESPACE)
    }

    /// Load a store persisted at `path`; missing files yield an empty store.
    pub fn from_persist_path(path: &Path) -> Result<Self> {
        Ok(Self::new(
            Arc::new(SimpleKvStore::from_persist_path(path)?),
            DEFAULT_INDEX_STORE_NAMESPACE,
        ))
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        self.kv.persist(path)
    }

    fn collection(&self) -> String {
        format!("{}/data", self.namespace)
    }

    /// Insert or replace a struct under its own index id.
    pub fn add_index_struct(&self, index_struct: &IndexStruct) -> Result<()> {
        self.kv.put(
            index_struct.index_id(),
            serde_json::to_value(index_struct)?,
            &self.collection(),
        )
    }

    pub fn delete_index_struct(&self, index_id: &str) -> Result<bool> {
        self.kv.delete(index_id, &self.collection())
    }

    /// Every stored struct, ordered by index id.
    pub fn index_structs(&self) -> Result<Vec<IndexStruct>> {
        self.kv
            .get_all(&self.collection())?
            .into_values()
            .map(|v| serde_json::from_value(v).map_err(RagError::from))
            .collect()
    }

    /// Fetch a struct by id. An empty id selects the only stored struct.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Ambiguous`] when `index_id` is empty and several structs exist.
    pub fn get_index_struct(&self, index_id: &str) -> Result<Option<IndexStruct>> {
        if index_id.is_empty() {
            let mut all = self.index_structs()?;
            return match all.len() {
                0 => Ok(None),
                1 => Ok(all.pop()),
                n => Err(RagError::Ambiguous(format!(
                    "{n} index structs stored; pass an index id"
                ))),
            };
        }
        self.kv
            .get(index_id, &self.collection())?
            .map(|v| serde_json::from_value(v).map_err(RagError::from))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structs::{IndexDict, IndexList};

    #[test]
    fn empty_id_picks_the_sole_struct() {
        let store = IndexStore::in_memory();
        assert!(store.get_index_struct("").unwrap().is_none());
        let s = IndexStruct::List(IndexList::new("one"));
        store.add_index_struct(&s).unwrap();
        assert_eq!(store.get_index_struct("").unwrap(), Some(s.clone()));
        assert_eq!(store.get_index_struct("one").unwrap(), Some(s));
    }

    #[test]
    fn empty_id_with_many_is_ambiguous() {
        let store = IndexStore::in_memory();
        store.add_index_struct(&IndexStruct::List(IndexList::new("a"))).unwrap();
        store.add_index_struct(&IndexStruct::Vector(IndexDict::new("b"))).unwrap();
        assert!(matches!(store.get_index_struct(""), Err(RagError::Ambiguous(_))));
        assert!(store.delete_index_struct("a").unwrap());
        assert_eq!(store.index_structs().unwrap().len(), 1);
    }
}
