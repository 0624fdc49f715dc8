//! Operational surface: system statistics, session cleanup and index
//! rebuild triggers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::info;

use crate::orchestrator::Orchestrator;
use crate::retriever::RetrieverStatsSnapshot;
use crate::session::SessionStats;
use nonu_config::AppConfig;
use nonu_store::{CollectionRegistry, DocumentIndexer, IndexerReport};

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub total_requests: u64,
    pub avg_processing_ms: u64,
    pub active_sessions: usize,
    pub retriever: RetrieverStatsSnapshot,
    pub collections: BTreeMap<String, usize>,
}

pub struct AdminOps {
    orchestrator: Arc<Orchestrator>,
    registry: Arc<CollectionRegistry>,
    indexer: Arc<DocumentIndexer>,
    metadata_dir: PathBuf,
    idle_timeout: Duration,
}

impl AdminOps {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        registry: Arc<CollectionRegistry>,
        indexer: Arc<DocumentIndexer>,
        config: &AppConfig,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            indexer,
            metadata_dir: PathBuf::from(&config.index.metadata_dir),
            idle_timeout: Duration::seconds(config.session.idle_timeout_s as i64),
        }
    }

    pub async fn system_stats(&self) -> Result<SystemStats> {
        let (total_requests, total_ms) = self.orchestrator.request_totals();
        let avg = if total_requests > 0 {
            total_ms / total_requests
        } else {
            0
        };

        let collections = self
            .registry
            .collection_counts()
            .await?
            .into_iter()
            .map(|(category, count)| (category.as_str().to_string(), count))
            .collect();

        Ok(SystemStats {
            total_requests,
            avg_processing_ms: avg,
            active_sessions: self.orchestrator.sessions().len(),
            retriever: self.orchestrator.retriever().stats(),
            collections,
        })
    }

    /// Evict sessions idle past the configured timeout. Called by the
    /// periodic sweep and exposed for manual triggering.
    pub async fn cleanup_idle_sessions(&self) -> usize {
        let evicted = self
            .orchestrator
            .sessions()
            .cleanup(Utc::now(), self.idle_timeout)
            .await;
        if evicted > 0 {
            info!(evicted, "session sweep complete");
        }
        evicted
    }

    pub async fn clear_session(&self, session_id: &str) -> bool {
        self.orchestrator.sessions().clear(session_id).await
    }

    pub async fn session_analytics(&self, session_id: &str) -> SessionStats {
        self.orchestrator.sessions().stats(session_id).await
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.orchestrator.sessions().active_sessions()
    }

    pub fn new_session_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub async fn rebuild_index(&self, force: bool) -> Result<IndexerReport> {
        self.indexer.build(&self.metadata_dir, force).await
    }
}
