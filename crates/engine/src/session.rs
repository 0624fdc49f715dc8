//! Per-session conversational memory: a rolling window of (user, bot)
//! pairs plus turn statistics.
//!
//! The map itself is lock-free across sessions; each session carries its
//! own `tokio::sync::Mutex`, which hands the lock out FIFO, so concurrent
//! turns for the same session serialize in call order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use nonu_store::Category;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Bot,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub exists: bool,
    pub total_interactions: u64,
    pub session_age_hours: f64,
    pub memory_length: usize,
    pub last_activity: DateTime<Utc>,
    pub categories_used: BTreeMap<String, u64>,
    pub avg_processing_ms: u64,
    pub total_processing_ms: u64,
}

impl SessionStats {
    pub fn missing() -> Self {
        Self {
            exists: false,
            total_interactions: 0,
            session_age_hours: 0.0,
            memory_length: 0,
            last_activity: Utc::now(),
            categories_used: BTreeMap::new(),
            avg_processing_ms: 0,
            total_processing_ms: 0,
        }
    }
}

#[derive(Debug)]
pub struct SessionState {
    session_id: String,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    primary_category: Category,
    /// Bounded to `2 * window_pairs` entries; oldest pair dropped first.
    history: VecDeque<(Speaker, String)>,
    window_pairs: usize,
    interaction_count: u64,
    category_counts: BTreeMap<String, u64>,
    total_processing_ms: u64,
}

impl SessionState {
    fn new(session_id: &str, category: Category, window_pairs: usize, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            created_at: now,
            last_activity: now,
            primary_category: category,
            history: VecDeque::new(),
            window_pairs,
            interaction_count: 0,
            category_counts: BTreeMap::new(),
            total_processing_ms: 0,
        }
    }

    /// Category of the previous turn, if any turn has completed.
    pub fn previous_category(&self) -> Option<Category> {
        (self.interaction_count > 0).then_some(self.primary_category)
    }

    pub fn primary_category(&self) -> Category {
        self.primary_category
    }

    /// The current turn's category becomes the session's primary category.
    pub fn set_category(&mut self, category: Category) {
        self.primary_category = category;
    }

    /// Render the rolling window for the `{history}` prompt variable.
    pub fn render_history(&self) -> String {
        self.history
            .iter()
            .map(|(speaker, text)| match speaker {
                Speaker::User => format!("사용자: {text}"),
                Speaker::Bot => format!("노느: {text}"),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Append one (user, bot) exchange, dropping the oldest pair when the
    /// window overflows.
    pub fn append_exchange(&mut self, user_text: &str, bot_text: &str) {
        self.history.push_back((Speaker::User, user_text.to_string()));
        self.history.push_back((Speaker::Bot, bot_text.to_string()));
        while self.history.len() > self.window_pairs * 2 {
            self.history.pop_front();
            self.history.pop_front();
        }
    }

    /// Book-keeping at the end of a turn. `last_activity` never moves
    /// backwards even if the supplied clock does.
    pub fn record_turn(&mut self, category: Category, elapsed_ms: u64, now: DateTime<Utc>) {
        self.interaction_count += 1;
        *self
            .category_counts
            .entry(category.as_str().to_string())
            .or_insert(0) += 1;
        self.total_processing_ms += elapsed_ms;
        self.touch(now);
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// Reset memory and counters; identity and creation time survive.
    pub fn reset(&mut self) {
        self.history.clear();
        self.interaction_count = 0;
        self.category_counts.clear();
        self.total_processing_ms = 0;
        debug!(session = %self.session_id, "session memory cleared");
    }

    pub fn stats(&self, now: DateTime<Utc>) -> SessionStats {
        let age_hours = (now - self.created_at).num_milliseconds().max(0) as f64 / 3_600_000.0;
        let avg = if self.interaction_count > 0 {
            self.total_processing_ms / self.interaction_count
        } else {
            0
        };
        SessionStats {
            exists: true,
            total_interactions: self.interaction_count,
            session_age_hours: (age_hours * 100.0).round() / 100.0,
            memory_length: self.history.len(),
            last_activity: self.last_activity,
            categories_used: self.category_counts.clone(),
            avg_processing_ms: avg,
            total_processing_ms: self.total_processing_ms,
        }
    }
}

pub struct SessionSlot {
    pub state: Mutex<SessionState>,
}

pub struct SessionStore {
    sessions: DashMap<String, Arc<SessionSlot>>,
    window_pairs: usize,
}

impl SessionStore {
    pub fn new(window_pairs: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            window_pairs: window_pairs.max(1),
        }
    }

    /// Fetch the session slot, creating it on first sight. The category
    /// seeds `primary_category` for brand-new sessions.
    pub fn get_or_create(&self, session_id: &str, category: Category) -> Arc<SessionSlot> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!(session = %session_id, "new session created");
                Arc::new(SessionSlot {
                    state: Mutex::new(SessionState::new(
                        session_id,
                        category,
                        self.window_pairs,
                        Utc::now(),
                    )),
                })
            })
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    pub async fn stats(&self, session_id: &str) -> SessionStats {
        match self.get(session_id) {
            Some(slot) => slot.state.lock().await.stats(Utc::now()),
            None => SessionStats::missing(),
        }
    }

    /// Reset a session's memory in place. Returns false for unknown ids.
    pub async fn clear(&self, session_id: &str) -> bool {
        match self.get(session_id) {
            Some(slot) => {
                slot.state.lock().await.reset();
                true
            }
            None => false,
        }
    }

    /// Evict sessions idle longer than `idle`. Returns the eviction count.
    pub async fn cleanup(&self, now: DateTime<Utc>, idle: Duration) -> usize {
        let entries: Vec<(String, Arc<SessionSlot>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut evicted = 0usize;
        for (session_id, slot) in entries {
            let last_activity = slot.state.lock().await.last_activity();
            if now - last_activity > idle {
                self.sessions.remove(&session_id);
                evicted += 1;
                info!(session = %session_id, "idle session evicted");
            }
        }
        evicted
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
