//! Two-stage query classifier: weighted keyword scoring first, the
//! fine-tuned remote model only when keywords cannot decide.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use nonu_config::AppConfig;
use nonu_store::Category;

/// Remote label source for the second classification stage. The engine
/// validates whatever comes back against the closed [`Category`] enum.
#[async_trait]
pub trait CategoryLabeler: Send + Sync {
    async fn classify_label(&self, query: &str) -> Result<String>;
}

#[async_trait]
impl CategoryLabeler for nonu_llm::RemoteClassifier {
    async fn classify_label(&self, query: &str) -> Result<String> {
        nonu_llm::RemoteClassifier::classify_label(self, query).await
    }
}

/// Keyword weight tiers: high = 3, medium = 2, low = 1. Matching is plain
/// substring containment over the case-folded query.
struct KeywordSet {
    category: Category,
    high: &'static [&'static str],
    medium: &'static [&'static str],
    low: &'static [&'static str],
}

const KEYWORD_SETS: &[KeywordSet] = &[
    KeywordSet {
        category: Category::Accident,
        high: &["사고", "충돌", "접촉", "추돌", "과실비율"],
        medium: &["교차로", "신호", "좌회전", "우회전", "직진", "후진", "주차"],
        low: &["차량", "자동차", "운전", "도로", "a차량", "b차량"],
    },
    KeywordSet {
        category: Category::Precedent,
        high: &["판례", "대법원", "고등법원", "지방법원", "사건번호"],
        medium: &["법원", "재판", "소송", "결정", "고법", "관련된", "관련", "찾아", "검색"],
        low: &["사건", "결과", "20", "19", "수원", "서울", "부산", "이와", "해당"],
    },
    KeywordSet {
        category: Category::Law,
        high: &["도로교통법", "법률", "조문", "법령"],
        medium: &["제", "조", "항", "규정", "위반"],
        low: &["법", "규칙", "처벌"],
    },
    KeywordSet {
        category: Category::Term,
        high: &["정의", "의미", "뜻", "설명", "무엇", "이란"],
        medium: &["용어", "개념"],
        low: &["라는", "말"],
    },
];

/// Follow-up markers that tie a vague query to the previous turn's
/// category. Each carries weight 2.
const CONTEXT_CARRY_COMMON: &[&str] = &["관련", "이것", "이거", "그것", "해당", "위"];
const CONTEXT_CARRY_PRECEDENT: &[&str] = &["찾아", "검색"];

/// Queries longer than this are truncated before keyword scoring; scoring a
/// multi-kilobyte paste adds nothing but latency.
const MAX_SCORING_BYTES: usize = 2048;

pub struct Classifier {
    confidence_threshold: f32,
    min_score: u32,
    remote_timeout: Duration,
    remote: Option<Arc<dyn CategoryLabeler>>,
}

impl Classifier {
    pub fn new(config: &AppConfig, remote: Option<Arc<dyn CategoryLabeler>>) -> Self {
        Self {
            confidence_threshold: config.classifier.confidence_threshold,
            min_score: config.classifier.min_score,
            remote_timeout: Duration::from_secs(config.classifier.remote_timeout_s),
            remote,
        }
    }

    /// Classify a query, optionally biased by the previous turn's category.
    /// Infallible: every failure path lands in [`Category::General`].
    pub async fn classify(&self, query: &str, previous: Option<Category>) -> Category {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Category::General;
        }

        let folded = clip_bytes(trimmed, MAX_SCORING_BYTES).to_lowercase();
        let scores = keyword_scores(&folded);
        let total: u32 = scores.iter().map(|(_, score)| score).sum();

        if let Some(&(best, max_score)) = scores.iter().max_by_key(|(_, score)| *score) {
            let confidence = max_score as f32 / total as f32;
            if max_score >= self.min_score && confidence >= self.confidence_threshold {
                info!(%best, max_score, confidence, "high-confidence keyword classification");
                return best;
            }
            debug!(%best, max_score, confidence, "keyword scores below thresholds");
        }

        if let Some(previous) = previous {
            if previous != Category::General {
                let carry = context_carry_weight(&folded, previous);
                if carry >= 2 {
                    info!(%previous, carry, "context-carry classification");
                    return previous;
                }
            }
        }

        if let Some(remote) = &self.remote {
            if trimmed.chars().count() > 10 {
                match tokio::time::timeout(self.remote_timeout, remote.classify_label(trimmed))
                    .await
                {
                    Ok(Ok(label)) => match Category::parse(&label) {
                        Some(category) => {
                            info!(%category, "remote classification accepted");
                            return category;
                        }
                        None => warn!(label, "remote classifier returned off-enum label"),
                    },
                    Ok(Err(err)) => warn!(?err, "remote classification failed"),
                    Err(_) => warn!("remote classification timed out"),
                }
            }
        }

        Category::General
    }
}

/// Per-category keyword score. Only categories with a non-zero score appear.
fn keyword_scores(folded_query: &str) -> Vec<(Category, u32)> {
    KEYWORD_SETS
        .iter()
        .filter_map(|set| {
            let mut score = 0u32;
            for keyword in set.high {
                if folded_query.contains(keyword) {
                    score += 3;
                }
            }
            for keyword in set.medium {
                if folded_query.contains(keyword) {
                    score += 2;
                }
            }
            for keyword in set.low {
                if folded_query.contains(keyword) {
                    score += 1;
                }
            }
            (score > 0).then_some((set.category, score))
        })
        .collect()
}

fn context_carry_weight(folded_query: &str, previous: Category) -> u32 {
    let mut weight = 0u32;
    for keyword in CONTEXT_CARRY_COMMON {
        if folded_query.contains(keyword) {
            weight += 2;
        }
    }
    if previous == Category::Precedent {
        for keyword in CONTEXT_CARRY_PRECEDENT {
            if folded_query.contains(keyword) {
                weight += 2;
            }
        }
    }
    weight
}

/// Byte-bounded clip that never splits a UTF-8 character.
pub(crate) fn clip_bytes(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
