use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Query-classification settings (keyword scoring + remote fallback).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Minimum share of the total keyword score the winning category needs.
    pub confidence_threshold: f32,
    /// Minimum absolute keyword score the winning category needs.
    pub min_score: u32,
    /// Timeout for the fine-tuned remote classifier call, in seconds.
    pub remote_timeout_s: u64,
    /// Model id of the fine-tuned classifier. Empty disables the remote
    /// fallback entirely. Overridden by `NONU_FINETUNED_MODEL`.
    pub finetuned_model: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.65,
            min_score: 4,
            remote_timeout_s: 5,
            finetuned_model: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Timeout for the single synthesis call, in seconds.
    pub timeout_s: u64,
    /// OpenAI-compatible API base URL.
    pub api_base_url: String,
    /// API key. Normally left empty here and supplied via `OPENAI_API_KEY`.
    pub api_key: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.3,
            max_tokens: 800,
            timeout_s: 45,
            api_base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    /// Snippets returned per query. Hard-capped at 3 by the retriever.
    pub max_docs: usize,
    /// Bounded FIFO cache size for formatted contexts.
    pub cache_size: usize,
    /// Self-query activates when at least this many trigger keywords match.
    pub self_query_trigger_count: usize,
    /// Self-query also activates for queries longer than this many chars.
    pub self_query_length_trigger: usize,
    /// Lightweight model used by the self-query planner.
    pub planner_model: String,
    /// Timeout for the planner call, in seconds.
    pub planner_timeout_s: u64,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            max_docs: 2,
            cache_size: 100,
            self_query_trigger_count: 2,
            self_query_length_trigger: 30,
            planner_model: "gpt-3.5-turbo".to_string(),
            planner_timeout_s: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Rolling window size in (user, bot) pairs. History holds 2x messages.
    pub history_window_pairs: usize,
    /// Sessions idle longer than this are evicted by the sweep.
    pub idle_timeout_s: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_window_pairs: 8,
            idle_timeout_s: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Embedding batch size. The embedding provider rejects oversized batches.
    pub batch_size: usize,
    pub force_rebuild: bool,
    pub embedding_model: String,
    /// Directory holding the source JSON corpora.
    pub metadata_dir: String,
    /// Directory the vector collections persist under.
    pub persist_dir: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            force_rebuild: false,
            embedding_model: "text-embedding-3-large".to_string(),
            metadata_dir: "metadata".to_string(),
            persist_dir: "vector_db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Directory for persisted message transcripts.
    pub data_dir: String,
    /// Interval between idle-session sweeps, in seconds.
    pub sweep_interval_s: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8420".to_string(),
            data_dir: ".nonu".to_string(),
            sweep_interval_s: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub classifier: ClassifierConfig,
    pub chat: ChatConfig,
    pub retriever: RetrieverConfig,
    pub session: SessionConfig,
    pub index: IndexConfig,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load from a TOML file, falling back to defaults when the file is
    /// absent. Secrets are taken from the environment when set so they never
    /// have to live in the config file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("OPENAI_API_KEY") {
            if !value.is_empty() {
                config.chat.api_key = value;
            }
        }
        if let Ok(value) = env::var("NONU_FINETUNED_MODEL") {
            if !value.is_empty() {
                config.classifier.finetuned_model = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Effective max_docs: the retriever never returns more than 3 snippets
    /// no matter what the file says.
    pub fn effective_max_docs(&self) -> usize {
        self.retriever.max_docs.clamp(1, 3)
    }

    pub fn remote_classifier_enabled(&self) -> bool {
        !self.classifier.finetuned_model.trim().is_empty()
    }
}
