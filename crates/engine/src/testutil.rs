//! Shared mock ports for engine tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::classify::CategoryLabeler;
use crate::message_store::{MessageStore, StoredMessage};
use nonu_llm::{ChatModel, Embedder};
use nonu_store::CollectionRegistry;

/// Scriptable chat model: fixed reply or hard failure, with a call counter
/// so tests can assert the one-shot-synthesis invariant.
pub struct MockChat {
    reply: Option<String>,
    pub calls: AtomicUsize,
}

impl MockChat {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatModel for MockChat {
    async fn generate(&self, _prompt: &str, _max_tokens: u32, _temperature: f32) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            Some(reply) => Ok(reply.clone()),
            None => bail!("mock chat failure"),
        }
    }
}

#[derive(Default)]
pub struct FailingLabeler {
    pub calls: AtomicUsize,
}

#[async_trait]
impl CategoryLabeler for FailingLabeler {
    async fn classify_label(&self, _query: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        bail!("labeler unavailable")
    }
}

pub struct FixedLabeler {
    label: String,
}

impl FixedLabeler {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
        }
    }
}

#[async_trait]
impl CategoryLabeler for FixedLabeler {
    async fn classify_label(&self, _query: &str) -> Result<String> {
        Ok(self.label.clone())
    }
}

/// Deterministic toy embedder: character-bucket frequency vector. Enough
/// for ranking to behave sensibly in tests without a provider.
pub struct ToyEmbedder;

const TOY_DIM: usize = 32;

#[async_trait]
impl Embedder for ToyEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; TOY_DIM];
        for ch in text.chars() {
            vector[(ch as usize) % TOY_DIM] += 1.0;
        }
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Registry over a temp directory, backed by the toy embedder.
pub fn toy_registry(dir: &std::path::Path) -> Arc<CollectionRegistry> {
    Arc::new(CollectionRegistry::new(dir, Arc::new(ToyEmbedder)))
}

/// In-memory message sink, optionally failing every append.
#[derive(Default)]
pub struct RecordingMessageStore {
    pub fail: bool,
    pub appended: std::sync::Mutex<Vec<(String, String, String)>>,
}

impl RecordingMessageStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MessageStore for RecordingMessageStore {
    async fn append(&self, session_id: &str, role: &str, text: &str) -> Result<()> {
        if self.fail {
            bail!("message store unavailable");
        }
        self.appended.lock().unwrap().push((
            session_id.to_string(),
            role.to_string(),
            text.to_string(),
        ));
        Ok(())
    }

    async fn list(&self, session_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        if self.fail {
            bail!("message store unavailable");
        }
        let appended = self.appended.lock().unwrap();
        Ok(appended
            .iter()
            .filter(|(id, _, _)| id == session_id)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .take(limit)
            .rev()
            .map(|(_, role, text)| StoredMessage {
                role: role.clone(),
                text: text.clone(),
                timestamp: chrono::Utc::now(),
            })
            .collect())
    }
}
