//! Storage substrate: key-value, document, index, vector, graph and chat stores.
//!
//! [`StorageContext`] bundles the stores one or more indexes operate over and
//! persists them into a directory:
//!
//! ```text
//! dir/docstore.json
//! dir/index_store.json
//! dir/vector_store.json            (default namespace)
//! dir/<ns>__vector_store.json      (other namespaces)
//! dir/graph_store.json
//! ```

pub mod chat_store;
pub mod docstore;
pub mod graph_store;
pub mod index_store;
pub mod kvstore;
pub mod vector_store;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::error::Result;

pub use chat_store::{ChatStore, SimpleChatStore};
pub use docstore::{DEFAULT_DOCSTORE_NAMESPACE, DocStore, RefDocInfo};
pub use graph_store::{
    DEFAULT_REL_MAP_LIMIT, Direction, GraphStore, GraphStoreData, RelHop, RelPath,
    SimpleGraphStore, Triplet,
};
pub use index_store::{DEFAULT_INDEX_STORE_NAMESPACE, IndexStore};
pub use kvstore::{DEFAULT_COLLECTION, FileKvStore, KvData, KvStore, SimpleKvStore, StoredValue};
pub use vector_store::{
    DEFAULT_MMR_THRESHOLD, SimpleVectorStore, SimpleVectorStoreData, VectorStore,
    VectorStoreQuery, VectorStoreQueryMode, VectorStoreQueryResult,
};

/// Namespace of the vector store indexes use unless told otherwise.
pub const DEFAULT_VECTOR_STORE: &str = "default";

pub const DOCSTORE_FNAME: &str = "docstore.json";
pub const INDEX_STORE_FNAME: &str = "index_store.json";
pub const VECTOR_STORE_FNAME: &str = "vector_store.json";
pub const GRAPH_STORE_FNAME: &str = "graph_store.json";

const NAMESPACE_SEP: &str = "__";

/// The set of stores an index reads and writes.
#[derive(Clone)]
pub struct StorageContext {
    docstore: Arc<DocStore>,
    index_store: Arc<IndexStore>,
    vector_stores: BTreeMap<String, Arc<dyn VectorStore>>,
    graph_store: Arc<dyn GraphStore>,
}

impl fmt::Debug for StorageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageContext")
            .field("docstore", &self.docstore)
            .field("index_store", &self.index_store)
            .field("vector_stores", &self.vector_stores.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for StorageContext {
    fn default() -> Self {
        Self::from_defaults()
    }
}

impl StorageContext {
    /// Fresh in-memory stores.
    pub fn from_defaults() -> Self {
        Self {
            docstore: Arc::new(DocStore::in_memory()),
            index_store: Arc::new(IndexStore::in_memory()),
            vector_stores: BTreeMap::from([(
                DEFAULT_VECTOR_STORE.to_string(),
                Arc::new(SimpleVectorStore::new()) as Arc<dyn VectorStore>,
            )]),
            graph_store: Arc::new(SimpleGraphStore::new()),
        }
    }

    /// Load stores persisted by [`persist`](Self::persist). Missing files yield empty stores.
    pub fn from_persist_dir(dir: &Path) -> Result<Self> {
        let mut vector_stores: BTreeMap<String, Arc<dyn VectorStore>> = BTreeMap::new();
        vector_stores.insert(
            DEFAULT_VECTOR_STORE.to_string(),
            Arc::new(SimpleVectorStore::from_persist_path(&dir.join(VECTOR_STORE_FNAME))?),
        );
        if dir.is_dir() {
            for entry in fs::read_dir(dir)? {
                let name = entry?.file_name().to_string_lossy().into_owned();
                let suffix = format!("{NAMESPACE_SEP}{VECTOR_STORE_FNAME}");
                if let Some(namespace) = name.strip_suffix(&suffix) {
                    vector_stores.insert(
                        namespace.to_string(),
                        Arc::new(SimpleVectorStore::from_persist_path(&dir.join(&name))?),
                    );
                }
            }
        }
        info!(dir = %dir.display(), vector_stores = vector_stores.len(), "loaded storage context");
        Ok(Self {
            docstore: Arc::new(DocStore::from_persist_path(&dir.join(DOCSTORE_FNAME))?),
            index_store: Arc::new(IndexStore::from_persist_path(&dir.join(INDEX_STORE_FNAME))?),
            vector_stores,
            graph_store: Arc::new(SimpleGraphStore::from_persist_path(
                &dir.join(GRAPH_STORE_FNAME),
            )?),
        })
    }

    /// Write every store under `dir`, creating it if needed.
    pub async fn persist(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        self.docstore.persist(&dir.join(DOCSTORE_FNAME))?;
        self.index_store.persist(&dir.join(INDEX_STORE_FNAME))?;
        for (namespace, store) in &self.vector_stores {
            let fname = if namespace == DEFAULT_VECTOR_STORE {
                VECTOR_STORE_FNAME.to_string()
            } else {
                format!("{namespace}{NAMESPACE_SEP}{VECTOR_STORE_FNAME}")
            };
            store.persist(&dir.join(fname)).await?;
        }
        self.graph_store.persist(&dir.join(GRAPH_STORE_FNAME)).await?;
        info!(dir = %dir.display(), "persisted storage context");
        Ok(())
    }

    pub fn with_docstore(mut self, docstore: Arc<DocStore>) -> Self {
        self.docstore = docstore;
        self
    }

    pub fn with_index_store(mut self, index_store: Arc<IndexStore>) -> Self {
        self.index_store = index_store;
        self
    }

    /// Replace the default-namespace vector store.
    pub fn with_vector_store(self, store: Arc<dyn VectorStore>) -> Self {
        self.with_namespaced_vector_store(DEFAULT_VECTOR_STORE, store)
    }

    pub fn with_namespaced_vector_store(
        mut self,
        namespace: impl Into<String>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        self.vector_stores.insert(namespace.into(), store);
        self
    }

    pub fn with_graph_store(mut self, graph_store: Arc<dyn GraphStore>) -> Self {
        self.graph_store = graph_store;
        self
    }

    pub fn docstore(&self) -> &Arc<DocStore> {
        &self.docstore
    }

    pub fn index_store(&self) -> &Arc<IndexStore> {
        &self.index_store
    }

    pub fn graph_store(&self) -> &Arc<dyn GraphStore> {
        &self.graph_store
    }

    /// The default-namespace vector store.
    pub fn vector_store(&self) -> Arc<dyn VectorStore> {
        self.vector_stores
            .get(DEFAULT_VECTOR_STORE)
            .cloned()
            .unwrap_or_else(|| Arc::new(SimpleVectorStore::new()))
    }

    pub fn namespaced_vector_store(&self, namespace: &str) -> Option<Arc<dyn VectorStore>> {
        self.vector_stores.get(namespace).cloned()
    }

    pub fn vector_store_namespaces(&self) -> impl Iterator<Item = &str> {
        self.vector_stores.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structs::{IndexDict, IndexStruct};
    use crate::schema::Node;

    #[tokio::test]
    async fn persist_and_reload_directory() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = StorageContext::from_defaults()
            .with_namespaced_vector_store("images", Arc::new(SimpleVectorStore::new()));
        let node = Node::with_id("x", "hello");
        ctx.docstore().add_documents(std::slice::from_ref(&node), false).unwrap();
        let mut dict = IndexDict::new("vi");
        dict.add_node("x", "x");
        let index_struct = IndexStruct::Vector(dict);
        ctx.index_store().add_index_struct(&index_struct).unwrap();
        ctx.persist(dir.path()).await.unwrap();

        for fname in [DOCSTORE_FNAME, INDEX_STORE_FNAME, VECTOR_STORE_FNAME, GRAPH_STORE_FNAME] {
            assert!(dir.path().join(fname).exists(), "{fname} missing");
        }
        assert!(dir.path().join("images__vector_store.json").exists());

        let loaded = StorageContext::from_persist_dir(dir.path()).unwrap();
        assert_eq!(loaded.docstore().get_node("x").unwrap().hash, node.hash);
        assert_eq!(loaded.index_store().get_index_struct("").unwrap(), Some(index_struct));
        assert!(loaded.namespaced_vector_store("images").is_some());
    }

    #[test]
    fn missing_dir_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = StorageContext::from_persist_dir(&dir.path().join("absent")).unwrap();
        assert!(ctx.docstore().docs().unwrap().is_empty());
        assert_eq!(ctx.vector_store_namespaces().collect::<Vec<_>>(), vec!["default"]);
    }
}
