//! Durable message transcripts: a thin append-only JSONL sink, one file
//! per session. Completely separate from the rolling session window; this
//! is what survives session eviction and feeds the history endpoint.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable sink for user/bot messages. Appends are best-effort from the
/// orchestrator's point of view; `list` feeds the history endpoint.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, session_id: &str, role: &str, text: &str) -> Result<()>;
    async fn list(&self, session_id: &str, limit: usize) -> Result<Vec<StoredMessage>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

pub struct JsonlMessageStore {
    dir: PathBuf,
}

impl JsonlMessageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_path(&self, session_id: &str) -> PathBuf {
        // Session ids come from clients; keep only filename-safe chars.
        let safe: String = session_id
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '-' || *ch == '_')
            .collect();
        let safe = if safe.is_empty() { "unnamed".to_string() } else { safe };
        self.dir.join(format!("{safe}.jsonl"))
    }
}

#[async_trait]
impl MessageStore for JsonlMessageStore {
    async fn append(&self, session_id: &str, role: &str, text: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.file_path(session_id);

        let record = StoredMessage {
            role: role.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
        };
        let line = serde_json::to_string(&record).context("serialize StoredMessage")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open message file {}", path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    async fn list(&self, session_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let path = self.file_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&path)
            .with_context(|| format!("open message file {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut records: Vec<StoredMessage> = reader
            .lines()
            .filter_map(|line| {
                let line = line.ok()?;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return None;
                }
                serde_json::from_str(trimmed).ok()
            })
            .collect();

        if records.len() > limit {
            let skip = records.len() - limit;
            records.drain(..skip);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_list_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlMessageStore::new(dir.path());

        store.append("sess-A", "user", "질문입니다").await.unwrap();
        store.append("sess-A", "bot", "답변입니다").await.unwrap();
        store.append("sess-B", "user", "다른 세션").await.unwrap();

        let messages = store.list("sess-A", 50).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].text, "답변입니다");
    }

    #[tokio::test]
    async fn list_keeps_only_the_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlMessageStore::new(dir.path());

        for i in 0..10 {
            store.append("sess", "user", &format!("m{i}")).await.unwrap();
        }
        let messages = store.list("sess", 3).await.unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].text, "m7");
        assert_eq!(messages[2].text, "m9");
    }

    #[tokio::test]
    async fn unknown_session_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlMessageStore::new(dir.path());
        assert!(store.list("nobody", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hostile_session_ids_stay_inside_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlMessageStore::new(dir.path());

        store.append("../../etc/passwd", "user", "x").await.unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].as_ref().unwrap().file_name();
        assert_eq!(name.to_string_lossy(), "etcpasswd.jsonl");
    }
}
