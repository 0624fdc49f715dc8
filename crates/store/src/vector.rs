use std::collections::HashSet;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::document::Document;
use nonu_llm::Embedder;

/// Vector search port over a single collection.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<Document>>;
    async fn similarity_search_with_score(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<(Document, f32)>>;
    async fn count(&self) -> Result<usize>;
    async fn add_documents(&self, docs: &[Document]) -> Result<()>;
}

/// One persisted record: the document plus its embedding and a content hash
/// used to drop duplicate inserts.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    #[serde(flatten)]
    document: Document,
    embedding: Vec<f32>,
    content_hash: String,
}

/// JSONL-file-backed vector collection. Records load into RAM on open;
/// queries embed through the injected [`Embedder`] and rank by cosine
/// similarity.
pub struct FileVectorStore {
    path: PathBuf,
    embedder: Arc<dyn Embedder>,
    records: RwLock<Vec<StoredRecord>>,
}

impl FileVectorStore {
    /// Open (or create empty) the collection persisted at `path`.
    /// Unparseable lines are skipped with a warning; one corrupt record
    /// must not take the whole collection down.
    pub fn open(path: impl AsRef<Path>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut records = Vec::new();

        if path.exists() {
            let file = fs::File::open(&path)
                .with_context(|| format!("open collection file {}", path.display()))?;
            let reader = BufReader::new(file);
            let mut skipped = 0usize;
            for line in reader.lines() {
                let line = line?;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<StoredRecord>(trimmed) {
                    Ok(record) => records.push(record),
                    Err(_) => skipped += 1,
                }
            }
            if skipped > 0 {
                warn!(path = %path.display(), skipped, "skipped corrupt collection records");
            }
            info!(path = %path.display(), records = records.len(), "collection loaded");
        }

        Ok(Self {
            path,
            embedder,
            records: RwLock::new(records),
        })
    }

    /// Drop all records and truncate the persisted file. Used by forced
    /// index rebuilds.
    pub async fn clear(&self) -> Result<()> {
        let mut records = self.records.write().await;
        records.clear();
        if self.path.exists() {
            fs::write(&self.path, b"")
                .with_context(|| format!("truncate collection file {}", self.path.display()))?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ranked(&self, query: &str, k: usize) -> Result<Vec<(Document, f32)>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_vector = self.embedder.embed(query).await?;

        let records = self.records.read().await;
        let mut scored: Vec<(usize, f32)> = records
            .iter()
            .enumerate()
            .map(|(idx, record)| (idx, cosine_similarity(&record.embedding, &query_vector)))
            .collect();
        scored.sort_by(|(_, a), (_, b)| b.total_cmp(a));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(idx, score)| (records[idx].document.clone(), score))
            .collect())
    }
}

#[async_trait]
impl VectorStore for FileVectorStore {
    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<Document>> {
        Ok(self
            .ranked(query, k)
            .await?
            .into_iter()
            .map(|(doc, _)| doc)
            .collect())
    }

    async fn similarity_search_with_score(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<(Document, f32)>> {
        self.ranked(query, k).await
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.records.read().await.len())
    }

    async fn add_documents(&self, docs: &[Document]) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = docs.iter().map(|doc| doc.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;

        let mut records = self.records.write().await;
        let mut seen: HashSet<String> = records
            .iter()
            .map(|record| record.content_hash.clone())
            .collect();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open collection file {}", self.path.display()))?;

        let mut added = 0usize;
        for (doc, embedding) in docs.iter().zip(embeddings) {
            let content_hash = content_hash(&doc.text);
            if !seen.insert(content_hash.clone()) {
                continue;
            }
            let record = StoredRecord {
                document: doc.clone(),
                embedding,
                content_hash,
            };
            let line = serde_json::to_string(&record)?;
            writeln!(file, "{line}")?;
            records.push(record);
            added += 1;
        }

        info!(path = %self.path.display(), added, total = records.len(), "documents added");
        Ok(())
    }
}

fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}


#[cfg(test)]
mod tests {
    use super::test_support::CharEmbedder;
    use super::*;

    fn doc(text: &str, case_id: &str) -> Document {
        Document::new(text).with_meta("case_id", case_id)
    }

    #[tokio::test]
    async fn add_then_search_returns_closest_document() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            FileVectorStore::open(dir.path().join("precedent.jsonl"), Arc::new(CharEmbedder))
                .unwrap();

        store
            .add_documents(&[
                doc("대법원 2019다12345 : 교차로 좌회전 사고", "2019다12345"),
                doc("서울고등법원 2015나60480 : 주차장 접촉사고", "2015나60480"),
            ])
            .await
            .unwrap();

        let results = store
            .similarity_search("대법원 2019다12345", 1)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].meta("case_id"), "2019다12345");
    }

    #[tokio::test]
    async fn scored_search_ranks_descending() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            FileVectorStore::open(dir.path().join("scored.jsonl"), Arc::new(CharEmbedder))
                .unwrap();
        store
            .add_documents(&[
                doc("신호위반 좌회전 사고", ""),
                doc("전혀 상관없는 내용 abcdefg", ""),
            ])
            .await
            .unwrap();

        let results = store
            .similarity_search_with_score("신호위반 사고", 2)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].1 >= results[1].1);
    }

    #[tokio::test]
    async fn persisted_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("term.jsonl");

        {
            let store = FileVectorStore::open(&path, Arc::new(CharEmbedder)).unwrap();
            store
                .add_documents(&[doc("과실비율 : 사고 책임의 비율", "")])
                .await
                .unwrap();
            assert_eq!(store.count().await.unwrap(), 1);
        }

        let reopened = FileVectorStore::open(&path, Arc::new(CharEmbedder)).unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_texts_are_inserted_once() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            FileVectorStore::open(dir.path().join("dup.jsonl"), Arc::new(CharEmbedder)).unwrap();

        let d = doc("같은 본문", "");
        store.add_documents(&[d.clone(), d.clone()]).await.unwrap();
        store.add_documents(&[d]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_truncates_file_and_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("law.jsonl");
        let store = FileVectorStore::open(&path, Arc::new(CharEmbedder)).unwrap();
        store
            .add_documents(&[doc("제5조 신호 또는 지시에 따를 의무", "")])
            .await
            .unwrap();

        store.clear().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);

        let reopened = FileVectorStore::open(&path, Arc::new(CharEmbedder)).unwrap();
        assert_eq!(reopened.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.jsonl");
        let store = FileVectorStore::open(&path, Arc::new(CharEmbedder)).unwrap();
        store.add_documents(&[doc("정상 레코드", "")]).await.unwrap();

        // Append garbage directly to the file.
        use std::io::Write as _;
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();

        let reopened = FileVectorStore::open(&path, Arc::new(CharEmbedder)).unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
    }

    #[test]
    fn cosine_similarity_basic_properties() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
