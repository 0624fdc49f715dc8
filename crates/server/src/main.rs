mod routes;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nonu_config::AppConfig;
use nonu_engine::{
    AdminOps, CategoryLabeler, Classifier, HybridRetriever, JsonlMessageStore, Orchestrator,
    SelfQueryPlanner, SessionStore,
};
use nonu_llm::{ChatModel, OpenAiChat, OpenAiEmbedder, RemoteClassifier};
use nonu_store::{CollectionRegistry, DocumentIndexer};

use routes::{AppState, router};

const EMBED_TIMEOUT_S: u64 = 30;

#[derive(Debug, Parser)]
#[command(name = "nonu", version, about = "교통사고 과실비율 상담 엔진")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "nonu.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (default).
    Serve {
        /// Override the configured bind address.
        #[arg(long)]
        addr: Option<String>,
    },
    /// Build or rebuild the vector collections from the JSON corpora.
    Index {
        /// Override the configured metadata directory.
        #[arg(long)]
        metadata_dir: Option<PathBuf>,
        /// Rebuild collections even when they are already populated.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("load config from {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone())),
        )
        .init();

    match cli.command {
        Some(Commands::Index {
            metadata_dir,
            force,
        }) => {
            let registry = build_registry(&config)?;
            let indexer = DocumentIndexer::new(registry, config.index.batch_size);
            let dir = metadata_dir.unwrap_or_else(|| PathBuf::from(&config.index.metadata_dir));
            let force = force || config.index.force_rebuild;

            let report = indexer.build(&dir, force).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Some(Commands::Serve { addr }) => {
            let addr = addr.unwrap_or_else(|| config.server.bind_addr.clone());
            serve(config, addr).await
        }
        None => {
            let addr = config.server.bind_addr.clone();
            serve(config, addr).await
        }
    }
}

fn build_registry(config: &AppConfig) -> Result<Arc<CollectionRegistry>> {
    let embedder = Arc::new(OpenAiEmbedder::new(
        &config.chat.api_base_url,
        &config.chat.api_key,
        &config.index.embedding_model,
        Duration::from_secs(EMBED_TIMEOUT_S),
    )?);
    Ok(Arc::new(CollectionRegistry::new(
        PathBuf::from(&config.index.persist_dir),
        embedder,
    )))
}

async fn serve(config: AppConfig, addr: String) -> Result<()> {
    if config.chat.api_key.is_empty() {
        warn!("OPENAI_API_KEY is not set; model calls will fail and canned fallbacks will be served");
    }

    let registry = build_registry(&config)?;

    let chat: Arc<dyn ChatModel> = Arc::new(OpenAiChat::new(
        &config.chat.api_base_url,
        &config.chat.api_key,
        &config.chat.model,
        Duration::from_secs(config.chat.timeout_s),
    )?);

    let planner_chat: Arc<dyn ChatModel> = Arc::new(OpenAiChat::new(
        &config.chat.api_base_url,
        &config.chat.api_key,
        &config.retriever.planner_model,
        Duration::from_secs(config.retriever.planner_timeout_s),
    )?);
    let planner = SelfQueryPlanner::new(
        planner_chat,
        Duration::from_secs(config.retriever.planner_timeout_s),
    );

    let remote: Option<Arc<dyn CategoryLabeler>> = if config.remote_classifier_enabled() {
        Some(Arc::new(RemoteClassifier::new(
            &config.chat.api_base_url,
            &config.chat.api_key,
            &config.classifier.finetuned_model,
            Duration::from_secs(config.classifier.remote_timeout_s),
        )?))
    } else {
        None
    };

    let retriever = Arc::new(HybridRetriever::new(registry.clone(), planner, &config));
    let sessions = Arc::new(SessionStore::new(config.session.history_window_pairs));
    let messages = Arc::new(JsonlMessageStore::new(
        PathBuf::from(&config.server.data_dir).join("messages"),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        Classifier::new(&config, remote),
        retriever,
        sessions,
        chat,
        messages,
        &config,
    ));

    let indexer = Arc::new(DocumentIndexer::new(registry.clone(), config.index.batch_size));
    let admin = Arc::new(AdminOps::new(
        orchestrator.clone(),
        registry,
        indexer,
        &config,
    ));

    // Periodic idle-session sweep.
    let sweep_admin = admin.clone();
    let sweep_interval = Duration::from_secs(config.server.sweep_interval_s.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.tick().await; // immediate first tick carries no work
        loop {
            ticker.tick().await;
            sweep_admin.cleanup_idle_sessions().await;
        }
    });

    let state = AppState {
        orchestrator,
        admin,
    };

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, model = %config.chat.model, "nonu server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
