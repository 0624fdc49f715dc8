//! Self-query planning: derive a metadata filter from the natural-language
//! query before vector search.
//!
//! One planner-LLM call per plan, behind a bounded timeout. The model is
//! asked for a fenced JSON block `{"filter": {...}, "query": "..."}`; any
//! parse or transport failure falls back to a deterministic no-filter plan
//! so retrieval always proceeds.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use nonu_llm::ChatModel;
use nonu_store::{Category, Document};

/// One filterable metadata attribute, described for the planner model.
#[derive(Debug, Clone, Copy)]
pub struct AttributeSpec {
    pub name: &'static str,
    pub description: &'static str,
}

/// Filterable attributes per category. Names must match the §3 metadata
/// keys the indexer writes.
pub fn attribute_schema(category: Category) -> &'static [AttributeSpec] {
    match category {
        Category::Precedent => &[
            AttributeSpec {
                name: "court",
                description: "판결을 내린 법원명 (예: 대법원, 서울고등법원)",
            },
            AttributeSpec {
                name: "case_id",
                description: "사건번호 (예: 2019다12345, 92도2077)",
            },
            AttributeSpec {
                name: "year",
                description: "판결 연도 (4자리 숫자)",
            },
        ],
        Category::Law => &[
            AttributeSpec {
                name: "article_number",
                description: "도로교통법 조문 번호 (예: 제5조, 제25조)",
            },
            AttributeSpec {
                name: "article_name",
                description: "조문명 (예: 신호 또는 지시에 따를 의무)",
            },
            AttributeSpec {
                name: "subsection_title",
                description: "조문 내 항 제목 (예: 제5조 1항)",
            },
            AttributeSpec {
                name: "keywords",
                description: "조문 관련 키워드 (예: 신호, 교차로)",
            },
        ],
        Category::Accident => &[
            AttributeSpec {
                name: "case_id",
                description: "교통사고 사례의 고유 식별자 (예: 차01-1)",
            },
            AttributeSpec {
                name: "base_ratio",
                description: "A차량과 B차량의 기본 과실비율",
            },
            AttributeSpec {
                name: "law_references",
                description: "적용되는 도로교통법 조문 (예: 도로교통법 제25조)",
            },
            AttributeSpec {
                name: "precedent",
                description: "관련 법원 판례 (예: 대법원 2011다3250)",
            },
        ],
        Category::Term => &[
            AttributeSpec {
                name: "term",
                description: "법률 용어명 (예: 과실, 도로, 차로)",
            },
            AttributeSpec {
                name: "category",
                description: "용어 분류 (예: 교통법규, 사고처리)",
            },
        ],
        Category::General => &[],
    }
}

fn corpus_description(category: Category) -> &'static str {
    match category {
        Category::Accident => "교통사고 사례, 과실비율, 법적 근거 및 판례 정보",
        Category::Precedent => "법원 판례, 사건번호, 판결 내용 및 법적 판단",
        Category::Law => "도로교통법 조문, 법률 내용 및 처벌 규정",
        Category::Term => "법률 용어 정의, 교통사고 관련 용어 설명",
        Category::General => "교통사고 관련 법률 정보",
    }
}

/// A metadata filter plus the (possibly rewritten) search query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfQueryPlan {
    pub filters: Vec<(String, String)>,
    pub query: String,
}

impl SelfQueryPlan {
    /// The fallback: search the original query with no filter.
    pub fn passthrough(query: &str) -> Self {
        Self {
            filters: Vec::new(),
            query: query.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlannerOutput {
    #[serde(default)]
    filter: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    query: Option<String>,
}

pub struct SelfQueryPlanner {
    chat: Arc<dyn ChatModel>,
    timeout: Duration,
}

impl SelfQueryPlanner {
    pub fn new(chat: Arc<dyn ChatModel>, timeout: Duration) -> Self {
        Self { chat, timeout }
    }

    /// Plan a filtered search. Deterministic fallback on any failure.
    pub async fn plan(&self, query: &str, category: Category) -> SelfQueryPlan {
        let schema = attribute_schema(category);
        if schema.is_empty() {
            return SelfQueryPlan::passthrough(query);
        }

        let prompt = planner_prompt(query, category, schema);
        let reply =
            match tokio::time::timeout(self.timeout, self.chat.generate(&prompt, 100, 0.0)).await
            {
                Ok(Ok(reply)) => reply,
                Ok(Err(err)) => {
                    warn!(?err, %category, "self-query planning failed, using passthrough");
                    return SelfQueryPlan::passthrough(query);
                }
                Err(_) => {
                    warn!(%category, "self-query planning timed out, using passthrough");
                    return SelfQueryPlan::passthrough(query);
                }
            };

        match parse_plan(&reply, query, schema) {
            Some(plan) => {
                debug!(filters = plan.filters.len(), "self-query plan built");
                plan
            }
            None => SelfQueryPlan::passthrough(query),
        }
    }
}

fn planner_prompt(query: &str, category: Category, schema: &[AttributeSpec]) -> String {
    let attributes = schema
        .iter()
        .map(|spec| format!("- {}: {}", spec.name, spec.description))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "다음 질문에서 검색 필터를 추출하세요.\n\
         문서 집합: {corpus}\n\
         필터 가능한 속성:\n{attributes}\n\n\
         질문: {query}\n\n\
         아래 형식의 JSON만 출력하세요. 질문에 명시된 속성만 filter에 넣고,\n\
         query에는 필터를 제외한 검색 문장을 넣으세요.\n\
         ```json\n{{\"filter\": {{}}, \"query\": \"...\"}}\n```",
        corpus = corpus_description(category),
    )
}

/// Parse the planner reply; unknown attribute names are dropped rather than
/// trusted. `None` means the reply was unusable.
fn parse_plan(reply: &str, original_query: &str, schema: &[AttributeSpec]) -> Option<SelfQueryPlan> {
    let output: PlannerOutput = extract_json_block(reply)?;

    let filters = output
        .filter
        .into_iter()
        .filter(|(name, _)| schema.iter().any(|spec| spec.name == name))
        .filter_map(|(name, value)| {
            let rendered = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                _ => return None,
            };
            let trimmed = rendered.trim().to_string();
            (!trimmed.is_empty()).then_some((name, trimmed))
        })
        .collect::<Vec<_>>();

    let query = match output.query {
        Some(q) if !q.trim().is_empty() => q.trim().to_string(),
        _ => original_query.to_string(),
    };

    Some(SelfQueryPlan { filters, query })
}

/// Extract the first usable JSON object from an LLM reply: a fenced
/// ```json block when present, otherwise the outermost bare braces.
fn extract_json_block<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(fence_end) = after_fence.find("```") {
            let body = after_fence[..fence_end].trim();
            if let Ok(value) = serde_json::from_str(body) {
                return Some(value);
            }
        }
    }

    let trimmed = response.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

/// Candidate filter: every (key, value) must appear as a case-folded
/// substring of the document's metadata value for that key.
pub fn matches_filters(doc: &Document, filters: &[(String, String)]) -> bool {
    filters.iter().all(|(key, value)| {
        let actual = doc.meta(key).to_lowercase();
        !actual.is_empty() && actual.contains(&value.to_lowercase())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockChat;

    #[test]
    fn parse_plan_accepts_fenced_json() {
        let reply = "추출 결과:\n```json\n{\"filter\": {\"article_number\": \"제5조\"}, \"query\": \"신호 의무\"}\n```";
        let plan = parse_plan(reply, "원래 질문", attribute_schema(Category::Law)).unwrap();
        assert_eq!(
            plan.filters,
            vec![("article_number".to_string(), "제5조".to_string())]
        );
        assert_eq!(plan.query, "신호 의무");
    }

    #[test]
    fn parse_plan_accepts_bare_json_and_keeps_original_query() {
        let reply = r#"{"filter": {"court": "대법원"}}"#;
        let plan = parse_plan(reply, "대법원 교통사고 판례", attribute_schema(Category::Precedent))
            .unwrap();
        assert_eq!(plan.filters, vec![("court".to_string(), "대법원".to_string())]);
        assert_eq!(plan.query, "대법원 교통사고 판례");
    }

    #[test]
    fn parse_plan_drops_unknown_attributes() {
        let reply = r#"{"filter": {"court": "대법원", "judge": "아무개"}, "query": "q"}"#;
        let plan = parse_plan(reply, "q", attribute_schema(Category::Precedent)).unwrap();
        assert_eq!(plan.filters.len(), 1);
        assert_eq!(plan.filters[0].0, "court");
    }

    #[test]
    fn parse_plan_rejects_prose() {
        assert!(parse_plan("필터가 없습니다", "q", attribute_schema(Category::Law)).is_none());
    }

    #[test]
    fn numeric_filter_values_are_rendered() {
        let reply = r#"{"filter": {"year": 2019}, "query": "대법원 판례"}"#;
        let plan = parse_plan(reply, "q", attribute_schema(Category::Precedent)).unwrap();
        assert_eq!(plan.filters, vec![("year".to_string(), "2019".to_string())]);
    }

    #[test]
    fn filters_match_by_substring() {
        let doc = Document::new("제5조(신호 또는 지시에 따를 의무) 내용")
            .with_meta("article_number", "제5조")
            .with_meta("article_name", "신호 또는 지시에 따를 의무");

        let hit = vec![("article_number".to_string(), "제5조".to_string())];
        let miss = vec![("article_number".to_string(), "제25조".to_string())];
        let absent = vec![("keywords".to_string(), "신호".to_string())];
        assert!(matches_filters(&doc, &hit));
        assert!(!matches_filters(&doc, &miss));
        assert!(!matches_filters(&doc, &absent));
        assert!(matches_filters(&doc, &[]));
    }

    #[tokio::test]
    async fn plan_falls_back_when_chat_fails() {
        let chat = Arc::new(MockChat::failing());
        let planner = SelfQueryPlanner::new(chat, Duration::from_secs(1));
        let plan = planner.plan("도로교통법 제5조", Category::Law).await;
        assert_eq!(plan, SelfQueryPlan::passthrough("도로교통법 제5조"));
    }

    #[tokio::test]
    async fn plan_uses_model_output() {
        let chat = Arc::new(MockChat::replying(
            "```json\n{\"filter\": {\"term\": \"과실\"}, \"query\": \"과실 정의\"}\n```",
        ));
        let planner = SelfQueryPlanner::new(chat, Duration::from_secs(1));
        let plan = planner.plan("과실이란?", Category::Term).await;
        assert_eq!(plan.filters, vec![("term".to_string(), "과실".to_string())]);
        assert_eq!(plan.query, "과실 정의");
    }
}
