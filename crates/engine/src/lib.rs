//! Query orchestration pipeline for the traffic-accident consultation bot.
//!
//! Per-turn data flow:
//! `query → Classifier → CitationExtractor (precedent only) → HybridRetriever
//! → PromptLibrary → SessionStore history → ChatModel → response →
//! SessionStore/MessageStore append`.
//!
//! The orchestrator makes at most one synthesis call per turn and never
//! propagates an error to the caller: every failure path degrades into a
//! canned Korean response with the `error` flag set on the turn result.

mod admin;
mod citation;
mod classify;
mod message_store;
mod orchestrator;
mod prompts;
mod retriever;
mod selfquery;
mod session;

#[cfg(test)]
pub(crate) mod testutil;

pub use admin::{AdminOps, SystemStats};
pub use citation::{Citation, CitationExtractor};
pub use classify::{CategoryLabeler, Classifier};
pub use message_store::{JsonlMessageStore, MessageStore, StoredMessage};
pub use orchestrator::{Orchestrator, TurnBreakdown, TurnResult};
pub use prompts::{PromptLibrary, PromptTemplate};
pub use retriever::{
    EXACT_PRECEDENT_NOT_FOUND_PREFIX, HybridRetriever, RetrieverStatsSnapshot,
};
pub use selfquery::{AttributeSpec, SelfQueryPlan, SelfQueryPlanner, attribute_schema};
pub use session::{SessionSlot, SessionState, SessionStats, SessionStore, Speaker};
