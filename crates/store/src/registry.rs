use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::debug;

use crate::document::Category;
use crate::error::StoreError;
use crate::vector::{FileVectorStore, VectorStore};
use nonu_llm::Embedder;

/// Maps logical categories to their physical collections and lazily caches
/// the opened handles. Double-checked under a read/write lock so concurrent
/// readers never race the one-time open.
pub struct CollectionRegistry {
    persist_dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    handles: RwLock<HashMap<Category, Arc<FileVectorStore>>>,
}

impl CollectionRegistry {
    pub fn new(persist_dir: impl Into<PathBuf>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            persist_dir: persist_dir.into(),
            embedder,
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Collection handle for `category` behind the [`VectorStore`] port.
    pub async fn collection(&self, category: Category) -> Result<Arc<dyn VectorStore>> {
        let store: Arc<dyn VectorStore> = self.file_collection(category).await?;
        Ok(store)
    }

    /// Concrete handle, used by the indexer for clear-and-rebuild.
    pub async fn file_collection(&self, category: Category) -> Result<Arc<FileVectorStore>> {
        let name = category
            .collection_name()
            .ok_or(StoreError::NoCollection(category))?;

        {
            let handles = self.handles.read().await;
            if let Some(handle) = handles.get(&category) {
                return Ok(Arc::clone(handle));
            }
        }

        let mut handles = self.handles.write().await;
        // Re-check: another task may have opened it while we waited.
        if let Some(handle) = handles.get(&category) {
            return Ok(Arc::clone(handle));
        }

        let path = self.persist_dir.join(format!("{name}.jsonl"));
        debug!(%category, path = %path.display(), "opening collection");
        let store = Arc::new(FileVectorStore::open(path, Arc::clone(&self.embedder))?);
        handles.insert(category, Arc::clone(&store));
        Ok(store)
    }

    /// Document counts per indexed category, for the admin surface.
    pub async fn collection_counts(&self) -> Result<HashMap<Category, usize>> {
        let mut counts = HashMap::new();
        for category in Category::INDEXED {
            let collection = self.collection(category).await?;
            counts.insert(category, collection.count().await?);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::test_support::CharEmbedder;

    #[tokio::test]
    async fn same_category_yields_same_handle() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CollectionRegistry::new(dir.path(), Arc::new(CharEmbedder));

        let first = registry.file_collection(Category::Precedent).await.unwrap();
        let second = registry.file_collection(Category::Precedent).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn general_has_no_collection() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CollectionRegistry::new(dir.path(), Arc::new(CharEmbedder));
        assert!(registry.collection(Category::General).await.is_err());
    }

    #[tokio::test]
    async fn collection_files_are_named_by_category() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CollectionRegistry::new(dir.path(), Arc::new(CharEmbedder));

        let law = registry.file_collection(Category::Law).await.unwrap();
        assert!(law.path().ends_with("traffic_law_rag.jsonl"));
        let accident = registry.file_collection(Category::Accident).await.unwrap();
        assert!(accident.path().ends_with("car_case.jsonl"));
    }
}
