//! Model ports and OpenAI-compatible HTTP clients.
//!
//! The engine talks to language models through two narrow ports:
//! [`ChatModel`] (prompt → text) and [`Embedder`] (text → dense vector).
//! A third client, [`RemoteClassifier`], wraps the fine-tuned
//! classification model and returns its raw label for the engine to
//! validate.

use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

/// Non-streaming chat completion port. One prompt in, one reply out.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn generate(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<String>;
}

/// Text embedding port. Dimension is fixed per deployment.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ── OpenAI-compatible chat client ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiChat {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn generate(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<String> {
        let endpoint = format!("{}/chat/completions", self.base_url);
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": prompt}
            ],
            "max_tokens": max_tokens,
            "temperature": temperature
        });

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("chat completion failed ({status}): {body}");
        }

        match parse_chat_content(&body) {
            Some(content) => {
                debug!(model = %self.model, reply_len = content.len(), "chat reply received");
                Ok(content)
            }
            None => bail!("chat response missing content: {body}"),
        }
    }
}

/// Pull the assistant text out of an OpenAI-compatible `/chat/completions`
/// body. Returns `None` when the body has no usable content.
fn parse_chat_content(body: &serde_json::Value) -> Option<String> {
    let content = body
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()?;
    if content.is_empty() {
        return None;
    }
    Some(content.to_string())
}

// ── OpenAI-compatible embeddings client ───────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    async fn request(&self, input: serde_json::Value) -> Result<Vec<Vec<f32>>> {
        let endpoint = format!("{}/embeddings", self.base_url);
        let payload = json!({
            "model": self.model,
            "input": input
        });

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("embedding request failed ({status}): {body}");
        }

        parse_embeddings(&body)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.request(json!(text)).await?;
        match vectors.pop() {
            Some(vector) if vectors.is_empty() => Ok(vector),
            _ => bail!("embedding response did not contain exactly one vector"),
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.request(json!(texts)).await?;
        if vectors.len() != texts.len() {
            bail!(
                "embedding count mismatch: requested {} got {}",
                texts.len(),
                vectors.len()
            );
        }
        Ok(vectors)
    }
}

/// Parse the `data[].embedding` arrays of an `/embeddings` response,
/// re-ordered by the provider-supplied `index` so batches stay aligned.
fn parse_embeddings(body: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let Some(items) = body.get("data").and_then(|data| data.as_array()) else {
        bail!("embedding response missing data array: {body}");
    };

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(items.len());
    for (position, item) in items.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|value| value.as_u64())
            .map(|value| value as usize)
            .unwrap_or(position);
        let Some(values) = item.get("embedding").and_then(|value| value.as_array()) else {
            bail!("embedding item missing vector: {item}");
        };
        let vector = values
            .iter()
            .filter_map(|value| value.as_f64())
            .map(|value| value as f32)
            .collect::<Vec<_>>();
        if vector.is_empty() {
            bail!("embedding item contained an empty vector");
        }
        indexed.push((index, vector));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, vector)| vector).collect())
}

// ── Fine-tuned remote classifier ──────────────────────────────────────────────

/// Thin client for the fine-tuned classification model. Returns the raw
/// label text; validating it against the category enum is the caller's job.
#[derive(Debug, Clone)]
pub struct RemoteClassifier {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl RemoteClassifier {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    pub async fn classify_label(&self, query: &str) -> Result<String> {
        let endpoint = format!("{}/chat/completions", self.base_url);
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "다음 질문을 accident, precedent, law, term, general 중 하나로 분류하세요."},
                {"role": "user", "content": query}
            ],
            "max_tokens": 10,
            "temperature": 0.0
        });

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("remote classification failed ({status}): {body}");
        }

        match parse_chat_content(&body) {
            Some(label) => Ok(label.trim().to_lowercase()),
            None => bail!("remote classifier returned no label"),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
