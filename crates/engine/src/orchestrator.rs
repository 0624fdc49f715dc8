//! End-to-end per-turn pipeline.
//!
//! `handle_turn` never returns an error: dependency failures degrade into
//! canned Korean responses with the `error` flag set, and the chat model is
//! called at most once per turn.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::classify::{Classifier, clip_bytes};
use crate::message_store::MessageStore;
use crate::prompts::{PromptLibrary, clip_chars};
use crate::retriever::{EXACT_PRECEDENT_NOT_FOUND_PREFIX, HybridRetriever};
use crate::session::{SessionStats, SessionStore};
use nonu_config::AppConfig;
use nonu_llm::ChatModel;
use nonu_store::Category;

/// Queries longer than this are clipped before classification scoring;
/// retrieval still sees the full text.
const MAX_CLASSIFY_BYTES: usize = 2048;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TurnBreakdown {
    pub classify_ms: u64,
    pub retrieve_ms: u64,
    pub synthesize_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnResult {
    pub category: Category,
    /// Markdown answer text.
    pub response: String,
    pub context_used: bool,
    /// True when a dependency failed and a canned fallback was served.
    pub error: bool,
    pub processing_time_ms: u64,
    pub breakdown: TurnBreakdown,
    pub session_stats: SessionStats,
}

pub struct Orchestrator {
    classifier: Classifier,
    retriever: Arc<HybridRetriever>,
    sessions: Arc<SessionStore>,
    chat: Arc<dyn ChatModel>,
    messages: Arc<dyn MessageStore>,
    chat_timeout: Duration,
    max_tokens: u32,
    temperature: f32,
    max_docs: usize,
    total_requests: AtomicU64,
    total_processing_ms: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        classifier: Classifier,
        retriever: Arc<HybridRetriever>,
        sessions: Arc<SessionStore>,
        chat: Arc<dyn ChatModel>,
        messages: Arc<dyn MessageStore>,
        config: &AppConfig,
    ) -> Self {
        Self {
            classifier,
            retriever,
            sessions,
            chat,
            messages,
            chat_timeout: Duration::from_secs(config.chat.timeout_s),
            max_tokens: config.chat.max_tokens,
            temperature: config.chat.temperature,
            max_docs: config.effective_max_docs(),
            total_requests: AtomicU64::new(0),
            total_processing_ms: AtomicU64::new(0),
        }
    }

    #[instrument(skip(self, query), fields(session = %session_id, query_len = query.len()))]
    pub async fn handle_turn(&self, session_id: &str, query: &str) -> TurnResult {
        let turn_start = Instant::now();
        let trimmed = query.trim();

        if trimmed.is_empty() {
            // Nothing to classify or retrieve; greet and point at the
            // available features.
            let slot = self.sessions.get_or_create(session_id, Category::General);
            let stats = slot.state.lock().await.stats(Utc::now());
            let total_ms = elapsed_ms(turn_start);
            self.note_request(total_ms);
            return TurnResult {
                category: Category::General,
                response: general_greeting(),
                context_used: false,
                error: false,
                processing_time_ms: total_ms,
                breakdown: TurnBreakdown::default(),
                session_stats: stats,
            };
        }

        let slot = self.sessions.get_or_create(session_id, Category::General);
        // Held across the whole turn: concurrent turns for the same session
        // serialize FIFO, and append order matches call order.
        let mut state = slot.state.lock().await;

        let classify_start = Instant::now();
        let previous = state.previous_category();
        let category = self
            .classifier
            .classify(clip_bytes(trimmed, MAX_CLASSIFY_BYTES), previous)
            .await;
        let classify_ms = elapsed_ms(classify_start);

        let retrieve_start = Instant::now();
        let context = self.retriever.search(trimmed, category, self.max_docs).await;
        let retrieve_ms = elapsed_ms(retrieve_start);

        state.set_category(category);

        let synthesize_start = Instant::now();
        let (response, context_used, error) = if let Some(case_id) =
            context.strip_prefix(EXACT_PRECEDENT_NOT_FOUND_PREFIX)
        {
            // The cited precedent is not in the store. Answering with a
            // different precedent is forbidden, so the model is skipped.
            (citation_not_found(case_id), false, false)
        } else {
            let template = PromptLibrary::template_for(category);
            let history = state.render_history();
            let prompt = PromptLibrary::assemble(template, &history, trimmed, &context);

            match tokio::time::timeout(
                self.chat_timeout,
                self.chat.generate(&prompt, self.max_tokens, self.temperature),
            )
            .await
            {
                Ok(Ok(reply)) => (reply.trim().to_string(), !context.is_empty(), false),
                Ok(Err(err)) => {
                    warn!(?err, %category, "synthesis failed, serving canned fallback");
                    (canned_fallback(category, trimmed), !context.is_empty(), true)
                }
                Err(_) => {
                    warn!(%category, "synthesis timed out, serving canned fallback");
                    (canned_fallback(category, trimmed), !context.is_empty(), true)
                }
            }
        };
        let synthesize_ms = elapsed_ms(synthesize_start);

        state.append_exchange(trimmed, &response);
        let total_ms = elapsed_ms(turn_start);
        state.record_turn(category, total_ms, Utc::now());
        let session_stats = state.stats(Utc::now());

        // Durable append is best-effort; failures are logged, never raised.
        if let Err(err) = self.messages.append(session_id, "user", trimmed).await {
            warn!(?err, "durable append failed for user message");
        }
        if let Err(err) = self.messages.append(session_id, "bot", &response).await {
            warn!(?err, "durable append failed for bot message");
        }
        drop(state);

        self.note_request(total_ms);
        info!(
            %category,
            classify_ms,
            retrieve_ms,
            synthesize_ms,
            total_ms,
            context_used,
            "turn complete"
        );

        TurnResult {
            category,
            response,
            context_used,
            error,
            processing_time_ms: total_ms,
            breakdown: TurnBreakdown {
                classify_ms,
                retrieve_ms,
                synthesize_ms,
            },
            session_stats,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn retriever(&self) -> &Arc<HybridRetriever> {
        &self.retriever
    }

    pub fn messages(&self) -> &Arc<dyn MessageStore> {
        &self.messages
    }

    /// (total requests, total processing milliseconds).
    pub fn request_totals(&self) -> (u64, u64) {
        (
            self.total_requests.load(Ordering::Relaxed),
            self.total_processing_ms.load(Ordering::Relaxed),
        )
    }

    fn note_request(&self, total_ms: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_processing_ms.fetch_add(total_ms, Ordering::Relaxed);
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

// ── canned responses ──────────────────────────────────────────────────────────

fn general_greeting() -> String {
    "👋 **노느 상담 챗봇**\n\n\
     안녕하세요! 교통사고 과실비율 상담 챗봇 **노느**입니다! 🚗\n\n\
     **🎯 이용 방법**:\n\
     • \"교차로에서 좌회전 중 사고가 났어요\" — 사고 상황 분석\n\
     • \"대법원 2019다12345 판례 내용은?\" — 판례 검색\n\
     • \"도로교통법 제5조 내용은?\" — 법률 조회\n\
     • \"과실비율이 무엇인가요?\" — 용어 설명\n\n\
     **어떤 도움이 필요하신가요?** 😊"
        .to_string()
}

fn citation_not_found(case_id: &str) -> String {
    format!(
        "⚖️ **판례 검색 결과**\n\n\
         **🔍 검색 내용**: \"{case_id}\"\n\n\
         **❌ 정확히 일치하는 판례를 찾을 수 없습니다**\n\n\
         **⚠️ 확인 사항**:\n\
         • 판례번호가 정확한지 다시 확인해주세요\n\
         • 법원명이 정확한지 확인해주세요\n\
         • 해당 판례가 교통사고 관련 판례인지 확인해주세요\n\n\
         **💡 올바른 검색 방법**:\n\
         • \"대법원 2019다12345 판례 내용은?\"\n\
         • \"교차로 좌회전 사고 판례\"\n\
         • \"대법원 교통사고 판례\"\n\n\
         **📞 다른 방식으로 질문해주시면 더 정확한 도움을 드릴 수 있습니다!**"
    )
}

fn canned_fallback(category: Category, query: &str) -> String {
    let excerpt = clip_chars(query, 50);
    match category {
        Category::Accident => format!(
            "사고 상황: \"{excerpt}...\"\n\n\
             현재 일시적으로 AI 응답 생성에 문제가 있습니다.\n\n\
             기본 안내:\n\
             - 교차로 사고의 경우 좌회전 차량의 과실비율이 높습니다\n\
             - 신호위반, 과속 등에 따라 비율이 조정됩니다\n\
             - 정확한 분석을 위해 상황을 더 자세히 말씀해 주세요\n\n\
             잠시 후 다시 시도해주세요."
        ),
        Category::Precedent => format!(
            "판례 검색: \"{excerpt}...\"\n\n\
             현재 일시적으로 AI 응답 생성에 문제가 있습니다.\n\n\
             기본 안내:\n\
             - 사건번호를 정확하게 입력해주세요 (예: 대법원 2019다12345)\n\
             - 교통사고 관련 판례는 대법원, 고등법원에서 확인 가능합니다\n\n\
             잠시 후 다시 시도해주세요."
        ),
        Category::Law => format!(
            "법률 조회: \"{excerpt}...\"\n\n\
             현재 일시적으로 AI 응답 생성에 문제가 있습니다.\n\n\
             기본 안내:\n\
             - 도로교통법은 교통안전을 위한 기본 법률입니다\n\
             - 조문 번호를 정확하게 입력해주세요 (예: 제5조, 제25조)\n\n\
             잠시 후 다시 시도해주세요."
        ),
        Category::Term => format!(
            "용어 설명: \"{excerpt}...\"\n\n\
             현재 일시적으로 AI 응답 생성에 문제가 있습니다.\n\n\
             기본 안내:\n\
             - 과실비율: 사고 책임의 비율(퍼센트)\n\
             - 차도: 도로에서 차량이 다니는 부분\n\n\
             잠시 후 다시 시도해주세요."
        ),
        Category::General => format!(
            "일반 상담: \"{excerpt}...\"\n\n\
             현재 일시적으로 AI 응답 생성에 문제가 있습니다.\n\n\
             기본 안내:\n\
             - 교통사고 과실비율 분석\n\
             - 도로교통법 조회\n\
             - 판례 검색\n\
             - 법률 용어 설명\n\n\
             잠시 후 다시 시도해주세요."
        ),
    }
}
