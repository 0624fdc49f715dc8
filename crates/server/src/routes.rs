//! HTTP surface: the per-turn chat endpoint, session admin endpoints and
//! the retrieval/extraction test endpoints.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;

use nonu_engine::{AdminOps, Citation, Orchestrator};
use nonu_store::Category;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub admin: Arc<AdminOps>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/new-chat", post(new_chat))
        .route("/session/:id/history", get(session_history))
        .route("/session/:id/clear", post(clear_session))
        .route("/session/:id/analytics", get(session_analytics))
        .route("/stats", get(system_stats))
        .route("/test/precedent", get(test_precedent))
        .route("/test/hybrid-rag", get(test_hybrid_rag))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    session_id: String,
    query: String,
}

async fn chat(State(state): State<AppState>, Json(request): Json<ChatRequest>) -> Response {
    if request.session_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "session_id must not be empty"})),
        )
            .into_response();
    }

    let result = state
        .orchestrator
        .handle_turn(request.session_id.trim(), &request.query)
        .await;
    Json(result).into_response()
}

async fn new_chat(State(state): State<AppState>) -> Json<serde_json::Value> {
    let session_id = state.admin.new_session_id();
    Json(json!({ "session_id": session_id }))
}

async fn session_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    let messages = match state.orchestrator.messages().list(&session_id, 200).await {
        Ok(messages) => messages,
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            )
                .into_response();
        }
    };
    let session_stats = state.admin.session_analytics(&session_id).await;
    Json(json!({
        "messages": messages,
        "session_stats": session_stats,
    }))
    .into_response()
}

async fn clear_session(State(state): State<AppState>, Path(session_id): Path<String>) -> Response {
    if state.admin.clear_session(&session_id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown session"})),
        )
            .into_response()
    }
}

async fn session_analytics(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    let stats = state.admin.session_analytics(&session_id).await;
    if !stats.exists {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown session"})),
        )
            .into_response();
    }
    Json(stats).into_response()
}

async fn system_stats(State(state): State<AppState>) -> Response {
    match state.admin.system_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

// ── test endpoints ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PrecedentTestQuery {
    case_number: String,
}

#[derive(Debug, Serialize)]
struct PrecedentTestResponse {
    input: String,
    citations: Vec<Citation>,
    detected_court: Option<&'static str>,
    result: String,
}

/// Extractor diagnostics: what the citation rules see in the input and what
/// the precedent gate returns for it.
async fn test_precedent(
    State(state): State<AppState>,
    Query(params): Query<PrecedentTestQuery>,
) -> Json<PrecedentTestResponse> {
    let extractor = state.orchestrator.retriever().extractor();
    let citations = extractor.extract(&params.case_number);
    let detected_court = extractor.detect_court(&params.case_number);

    let result = state
        .orchestrator
        .retriever()
        .search(&params.case_number, Category::Precedent, 2)
        .await;

    Json(PrecedentTestResponse {
        input: params.case_number,
        citations,
        detected_court,
        result,
    })
}

#[derive(Debug, Deserialize)]
struct HybridTestQuery {
    query: String,
    category: String,
}

async fn test_hybrid_rag(
    State(state): State<AppState>,
    Query(params): Query<HybridTestQuery>,
) -> Response {
    let Some(category) = Category::parse(&params.category) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("unknown category: {}", params.category)})),
        )
            .into_response();
    };

    let result = state
        .orchestrator
        .retriever()
        .search(&params.query, category, 3)
        .await;

    Json(json!({
        "input_query": params.query,
        "category": category,
        "search_result": result,
        "search_statistics": state.orchestrator.retriever().stats(),
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::util::ServiceExt;

    use nonu_config::AppConfig;
    use nonu_engine::{
        Classifier, HybridRetriever, JsonlMessageStore, SelfQueryPlanner, SessionStore,
    };
    use nonu_llm::{ChatModel, Embedder};
    use nonu_store::{CollectionRegistry, DocumentIndexer};

    struct StubChat;

    #[async_trait::async_trait]
    impl ChatModel for StubChat {
        async fn generate(&self, _p: &str, _m: u32, _t: f32) -> anyhow::Result<String> {
            Ok("테스트 응답".to_string())
        }
    }

    struct StubEmbedder;

    #[async_trait::async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            let mut v = vec![0.0f32; 16];
            for ch in text.chars() {
                v[(ch as usize) % 16] += 1.0;
            }
            Ok(v)
        }
        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed(t).await?);
            }
            Ok(out)
        }
    }

    fn test_state(dir: &std::path::Path) -> AppState {
        let config = AppConfig::default();
        let registry = Arc::new(CollectionRegistry::new(
            dir.join("vector_db"),
            Arc::new(StubEmbedder),
        ));
        let chat: Arc<dyn ChatModel> = Arc::new(StubChat);
        let planner = SelfQueryPlanner::new(chat.clone(), Duration::from_secs(1));
        let retriever = Arc::new(HybridRetriever::new(registry.clone(), planner, &config));
        let orchestrator = Arc::new(Orchestrator::new(
            Classifier::new(&config, None),
            retriever,
            Arc::new(SessionStore::new(8)),
            chat,
            Arc::new(JsonlMessageStore::new(dir.join("messages"))),
            &config,
        ));
        let indexer = Arc::new(DocumentIndexer::new(registry.clone(), 50));
        let admin = Arc::new(AdminOps::new(
            orchestrator.clone(),
            registry,
            indexer,
            &config,
        ));
        AppState {
            orchestrator,
            admin,
        }
    }

    #[tokio::test]
    async fn chat_endpoint_returns_turn_result() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let request = Request::post("/api/chat")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&json!({"session_id": "s1", "query": "안녕하세요 문의드립니다"}))
                    .unwrap(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["response"], "테스트 응답");
        assert_eq!(body["category"], "general");
        assert!(body["session_stats"]["exists"].as_bool().unwrap());
    }

    #[tokio::test]
    async fn blank_session_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let request = Request::post("/api/chat")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&json!({"session_id": "  ", "query": "질문"})).unwrap(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn new_chat_allocates_a_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let response = app
            .oneshot(Request::post("/new-chat").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(!body["session_id"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_unknown_session_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let response = app
            .oneshot(
                Request::post("/session/ghost/clear")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn hybrid_test_endpoint_validates_category() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let response = app
            .oneshot(
                Request::get("/test/hybrid-rag?query=abc&category=nonsense")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn precedent_test_endpoint_reports_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let uri = format!(
            "/test/precedent?case_number={}",
            urlencode("대법원 2019다12345")
        );
        let response = app
            .oneshot(Request::get(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["citations"][0]["case_id"], "2019다12345");
        assert_eq!(body["detected_court"], "대법원");
    }

    fn urlencode(raw: &str) -> String {
        raw.bytes()
            .map(|b| match b {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => {
                    (b as char).to_string()
                }
                other => format!("%{other:02X}"),
            })
            .collect()
    }
}
