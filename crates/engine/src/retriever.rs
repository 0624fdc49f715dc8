//! Hybrid retrieval: direct similarity search combined with
//! metadata-filtered self-query search, behind a bounded FIFO context
//! cache.
//!
//! Precedent queries that carry an explicit citation take a separate gate:
//! the citation must match a stored `case_id` exactly (or at least by its
//! year+chamber+serial core), otherwise the sentinel string is returned and
//! synthesis is short-circuited. Answering a specific citation with a
//! different precedent is worse than answering nothing.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::citation::{Citation, CitationExtractor};
use crate::prompts::clip_chars;
use crate::selfquery::{SelfQueryPlanner, matches_filters};
use nonu_config::AppConfig;
use nonu_store::{Category, CollectionRegistry, Document, VectorStore};

/// Sentinel returned when a user-supplied citation is absent from the
/// store. The orchestrator replaces it with the fixed non-found response;
/// it never reaches the chat model.
pub const EXACT_PRECEDENT_NOT_FOUND_PREFIX: &str = "EXACT_PRECEDENT_NOT_FOUND:";

/// Candidates pulled per citation in the precedent gate.
const GATE_CANDIDATES: usize = 10;
/// The retriever never returns more snippets than this.
const HARD_MAX_DOCS: usize = 3;
const SNIPPET_CHARS: usize = 200;
const EXACT_BLOCK_CHARS: usize = 500;
/// Documents are considered duplicates when their first 100 chars agree.
const DEDUPE_PREFIX_CHARS: usize = 100;

static YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(19|20)\d{2}").expect("year pattern"));

/// Keywords that suggest the query names filterable metadata, making the
/// self-query pass worth its planner call.
fn self_query_triggers(category: Category) -> &'static [&'static str] {
    match category {
        Category::Precedent => &["대법원", "고등법원", "지방법원", "법원"],
        Category::Law => &["제", "조", "항", "번호", "신호", "교차로", "안전", "운전"],
        Category::Accident => &["a차량", "b차량", "비율", "과실", "좌회전", "직진", "교차로", "신호"],
        Category::Term => &["정의", "의미", "개념", "용어"],
        Category::General => &[],
    }
}

#[derive(Debug, Default)]
struct RetrieverStats {
    direct_searches: AtomicU64,
    self_query_searches: AtomicU64,
    cache_hits: AtomicU64,
    hybrid_searches: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct RetrieverStatsSnapshot {
    pub direct_searches: u64,
    pub self_query_searches: u64,
    pub cache_hits: u64,
    pub hybrid_searches: u64,
    pub cache_entries: usize,
}

/// Bounded FIFO map: inserting at capacity evicts the oldest entry.
struct FifoCache {
    capacity: usize,
    map: HashMap<(Category, u64), String>,
    order: VecDeque<(Category, u64)>,
}

impl FifoCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &(Category, u64)) -> Option<String> {
        self.map.get(key).cloned()
    }

    fn insert(&mut self, key: (Category, u64), value: String) {
        if self.capacity == 0 {
            return;
        }
        if self.map.contains_key(&key) {
            self.map.insert(key, value);
            return;
        }
        while self.map.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.map.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(key);
        self.map.insert(key, value);
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

pub struct HybridRetriever {
    registry: Arc<CollectionRegistry>,
    planner: SelfQueryPlanner,
    extractor: CitationExtractor,
    trigger_count: usize,
    length_trigger: usize,
    cache: Mutex<FifoCache>,
    stats: RetrieverStats,
}

impl HybridRetriever {
    pub fn new(
        registry: Arc<CollectionRegistry>,
        planner: SelfQueryPlanner,
        config: &AppConfig,
    ) -> Self {
        Self {
            registry,
            planner,
            extractor: CitationExtractor::new(),
            trigger_count: config.retriever.self_query_trigger_count,
            length_trigger: config.retriever.self_query_length_trigger,
            cache: Mutex::new(FifoCache::new(config.retriever.cache_size)),
            stats: RetrieverStats::default(),
        }
    }

    /// Retrieve a pre-formatted context string for the query, or `""` when
    /// nothing useful exists. Never errors: store and planner failures
    /// degrade to direct-only results, then to the empty string.
    pub async fn search(&self, query: &str, category: Category, max_docs: usize) -> String {
        let max_docs = max_docs.clamp(1, HARD_MAX_DOCS);

        if category == Category::General {
            return String::new();
        }

        if category == Category::Precedent {
            let citations = self.extractor.extract(query);
            if !citations.is_empty() {
                return self.precedent_gate(&citations).await;
            }
            debug!("precedent query without citation, using hybrid search");
        }

        let key = (category, hash_query(query));
        let cached = self.cache.lock().expect("cache lock").get(&key);
        if let Some(hit) = cached {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(%category, "retrieval cache hit");
            return hit;
        }

        self.stats.hybrid_searches.fetch_add(1, Ordering::Relaxed);
        let context = self.hybrid(query, category, max_docs).await;

        if !context.is_empty() {
            self.cache.lock().expect("cache lock").insert(key, context.clone());
        }
        context
    }

    pub fn extractor(&self) -> &CitationExtractor {
        &self.extractor
    }

    pub fn stats(&self) -> RetrieverStatsSnapshot {
        RetrieverStatsSnapshot {
            direct_searches: self.stats.direct_searches.load(Ordering::Relaxed),
            self_query_searches: self.stats.self_query_searches.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            hybrid_searches: self.stats.hybrid_searches.load(Ordering::Relaxed),
            cache_entries: self.cache.lock().expect("cache lock").len(),
        }
    }

    // ── precedent-citation gate ───────────────────────────────────────────

    async fn precedent_gate(&self, citations: &[Citation]) -> String {
        let collection = match self.registry.collection(Category::Precedent).await {
            Ok(collection) => collection,
            Err(err) => {
                warn!(?err, "precedent collection unavailable");
                return String::new();
            }
        };

        let mut partial_hit: Option<(Document, Citation)> = None;
        let mut any_lookup_succeeded = false;

        for citation in citations {
            let candidates = match collection
                .similarity_search(&citation.raw, GATE_CANDIDATES)
                .await
            {
                Ok(candidates) => {
                    any_lookup_succeeded = true;
                    candidates
                }
                Err(err) => {
                    warn!(?err, case_id = %citation.case_id, "citation lookup failed");
                    continue;
                }
            };

            for doc in candidates {
                let doc_case_id = doc.meta("case_id");
                if self.extractor.is_exact_match(&citation.case_id, doc_case_id) {
                    info!(case_id = %citation.case_id, "exact precedent match");
                    return format_precedent_block(&doc, citation, true);
                }
                if partial_hit.is_none()
                    && self.extractor.is_partial_match(&citation.case_id, doc_case_id)
                {
                    partial_hit = Some((doc, citation.clone()));
                }
            }
        }

        if let Some((doc, citation)) = partial_hit {
            info!(case_id = %citation.case_id, "partial precedent match");
            return format_precedent_block(&doc, &citation, false);
        }

        if !any_lookup_succeeded {
            // Store trouble, not verified absence. Degrade instead of
            // asserting the citation does not exist.
            return String::new();
        }

        info!(case_id = %citations[0].case_id, "cited precedent not in store");
        format!("{EXACT_PRECEDENT_NOT_FOUND_PREFIX}{}", citations[0].case_id)
    }

    // ── hybrid direct + self-query search ─────────────────────────────────

    async fn hybrid(&self, query: &str, category: Category, max_docs: usize) -> String {
        let collection = match self.registry.collection(category).await {
            Ok(collection) => collection,
            Err(err) => {
                warn!(?err, %category, "collection unavailable");
                return String::new();
            }
        };

        let direct = match collection.similarity_search(query, max_docs * 2).await {
            Ok(docs) => {
                self.stats.direct_searches.fetch_add(1, Ordering::Relaxed);
                docs
            }
            Err(err) => {
                warn!(?err, %category, "direct search failed");
                Vec::new()
            }
        };

        let mut self_query_results = Vec::new();
        if self.should_use_self_query(query, category) {
            match self
                .self_query(query, category, max_docs, collection.as_ref())
                .await
            {
                Ok(docs) => {
                    self.stats.self_query_searches.fetch_add(1, Ordering::Relaxed);
                    self_query_results = docs;
                }
                Err(err) => {
                    warn!(?err, %category, "self-query search failed, using direct results");
                }
            }
        }

        let combined = merge_dedupe(self_query_results, direct, max_docs);
        if combined.is_empty() {
            debug!(%category, "no retrieval results");
            return String::new();
        }
        format_results(&combined, category)
    }

    fn should_use_self_query(&self, query: &str, category: Category) -> bool {
        let folded = query.to_lowercase();
        let mut trigger_count = self_query_triggers(category)
            .iter()
            .filter(|trigger| folded.contains(*trigger))
            .count();
        if category == Category::Precedent && YEAR.is_match(query) {
            trigger_count += 1;
        }

        let should = trigger_count >= self.trigger_count
            || query.chars().count() > self.length_trigger;
        if should {
            debug!(%category, trigger_count, "self-query activated");
        }
        should
    }

    async fn self_query(
        &self,
        query: &str,
        category: Category,
        max_docs: usize,
        collection: &dyn VectorStore,
    ) -> anyhow::Result<Vec<Document>> {
        let plan = self.planner.plan(query, category).await;
        let candidates = collection
            .similarity_search(&plan.query, GATE_CANDIDATES)
            .await?;
        Ok(candidates
            .into_iter()
            .filter(|doc| matches_filters(doc, &plan.filters))
            .take(max_docs)
            .collect())
    }
}

// ── merging and formatting ────────────────────────────────────────────────────

/// Self-query results first (the more precise pass), then direct results,
/// deduplicated by the head of the text, truncated to `max_docs`.
fn merge_dedupe(
    self_query_results: Vec<Document>,
    direct_results: Vec<Document>,
    max_docs: usize,
) -> Vec<Document> {
    let mut seen: HashSet<u64> = HashSet::new();
    self_query_results
        .into_iter()
        .chain(direct_results)
        .filter(|doc| seen.insert(hash_query(&clip_chars(&doc.text, DEDUPE_PREFIX_CHARS))))
        .take(max_docs)
        .collect()
}

fn format_results(docs: &[Document], category: Category) -> String {
    docs.iter()
        .enumerate()
        .map(|(i, doc)| {
            let snippet = clip_chars(&doc.text, SNIPPET_CHARS);
            let meta = metadata_line(doc, category);
            if meta.is_empty() {
                format!("[{}] {snippet}", i + 1)
            } else {
                format!("[{}] {snippet}\n{meta}", i + 1)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// One-line metadata projection per category, matching the corpus fields.
fn metadata_line(doc: &Document, category: Category) -> String {
    match category {
        Category::Accident => {
            let case_id = doc.meta("case_id");
            if case_id.is_empty() {
                String::new()
            } else {
                format!("사건: {case_id}, 비율: {}", doc.meta("base_ratio"))
            }
        }
        Category::Precedent => {
            let case_id = doc.meta("case_id");
            if case_id.is_empty() {
                String::new()
            } else {
                format!("판례: {case_id}, 법원: {}", doc.meta("court"))
            }
        }
        Category::Law => {
            let title = doc.meta("article_title");
            if title.is_empty() {
                String::new()
            } else {
                format!("조문: {title}")
            }
        }
        Category::Term => {
            let term = doc.meta("term");
            if term.is_empty() {
                String::new()
            } else {
                format!("용어: {term}")
            }
        }
        Category::General => String::new(),
    }
}

fn format_precedent_block(doc: &Document, citation: &Citation, exact: bool) -> String {
    let case_id = {
        let stored = doc.meta("case_id");
        if stored.is_empty() { citation.case_id.as_str() } else { stored }
    };
    let court = {
        let stored = doc.meta("court");
        if stored.is_empty() { "미상" } else { stored }
    };
    let content = clip_chars(&doc.text, EXACT_BLOCK_CHARS);
    let match_type = if exact { "정확한 매칭" } else { "부분 매칭" };

    let mut block = format!(
        "✅ **판례 검색 성공** ({match_type})\n\n\
         📝 **판례 정보:**\n\
         - 사건번호: {case_id}\n\
         - 법원: {court}\n\n\
         📜 **판례 내용:**\n{content}\n"
    );
    if !exact {
        block.push_str(&format!(
            "\n📝 **매칭 안내:** 입력하신 '{}'와 유사한 판례입니다.\n",
            citation.case_id
        ));
    }
    block
}

fn hash_query(query: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    query.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockChat, toy_registry};
    use std::time::Duration;

    async fn seed_precedents(registry: &Arc<CollectionRegistry>) {
        let collection = registry
            .file_collection(Category::Precedent)
            .await
            .unwrap();
        collection
            .add_documents(&[
                Document::new("대법원 2019다12345 : 교차로에서 좌회전 중 직진 차량과 충돌한 사안에서 좌회전 차량의 과실을 70%로 본 사례")
                    .with_meta("court", "대법원")
                    .with_meta("case_id", "2019다12345"),
                Document::new("서울고등법원 2015나60480 : 주차장 접촉사고에서 후진 차량의 주의의무를 인정한 사례")
                    .with_meta("court", "서울고등법원")
                    .with_meta("case_id", "2015나60480"),
            ])
            .await
            .unwrap();
    }

    fn retriever(registry: Arc<CollectionRegistry>) -> HybridRetriever {
        let planner = SelfQueryPlanner::new(
            Arc::new(MockChat::failing()),
            Duration::from_millis(100),
        );
        HybridRetriever::new(registry, planner, &AppConfig::default())
    }

    #[tokio::test]
    async fn exact_citation_returns_single_block() {
        let dir = tempfile::tempdir().unwrap();
        let registry = toy_registry(dir.path());
        seed_precedents(&registry).await;
        let retriever = retriever(registry);

        let context = retriever
            .search("대법원 2019다12345 판례 내용 알려줘", Category::Precedent, 2)
            .await;
        assert!(context.contains("판례 검색 성공"));
        assert!(context.contains("정확한 매칭"));
        assert!(context.contains("2019다12345"));
        assert!(context.contains("대법원"));
    }

    #[tokio::test]
    async fn fabricated_citation_returns_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let registry = toy_registry(dir.path());
        seed_precedents(&registry).await;
        let retriever = retriever(registry);

        let context = retriever
            .search("대법원 9999다99999 판례 알려줘", Category::Precedent, 2)
            .await;
        assert_eq!(context, "EXACT_PRECEDENT_NOT_FOUND:9999다99999");
    }

    #[tokio::test]
    async fn citation_against_empty_collection_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = toy_registry(dir.path());
        let retriever = retriever(registry);

        let context = retriever
            .search("2019다12345 판례", Category::Precedent, 2)
            .await;
        assert!(context.starts_with(EXACT_PRECEDENT_NOT_FOUND_PREFIX));
    }

    #[tokio::test]
    async fn topic_precedent_query_uses_hybrid_search() {
        let dir = tempfile::tempdir().unwrap();
        let registry = toy_registry(dir.path());
        seed_precedents(&registry).await;
        let retriever = retriever(registry);

        let context = retriever
            .search("신호위반 관련 판례 알려줘", Category::Precedent, 2)
            .await;
        assert!(!context.starts_with(EXACT_PRECEDENT_NOT_FOUND_PREFIX));
        assert!(context.starts_with("[1] "));
        assert!(context.contains("판례: "));
    }

    #[tokio::test]
    async fn general_category_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = toy_registry(dir.path());
        let retriever = retriever(registry);
        assert_eq!(retriever.search("안녕하세요", Category::General, 2).await, "");
    }

    #[tokio::test]
    async fn empty_collection_returns_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = toy_registry(dir.path());
        let retriever = retriever(registry);
        assert_eq!(retriever.search("도로교통법 제5조", Category::Law, 2).await, "");
    }

    #[tokio::test]
    async fn repeated_query_hits_cache() {
        let dir = tempfile::tempdir().unwrap();
        let registry = toy_registry(dir.path());
        seed_precedents(&registry).await;
        let retriever = retriever(registry);

        let first = retriever
            .search("신호위반 판례가 궁금해요", Category::Precedent, 2)
            .await;
        let second = retriever
            .search("신호위반 판례가 궁금해요", Category::Precedent, 2)
            .await;
        assert_eq!(first, second);

        let stats = retriever.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.hybrid_searches, 1);
    }

    #[tokio::test]
    async fn snippets_are_bounded_in_count_and_length() {
        let dir = tempfile::tempdir().unwrap();
        let registry = toy_registry(dir.path());
        let collection = registry.file_collection(Category::Term).await.unwrap();
        let long_docs: Vec<Document> = (0..6)
            .map(|i| {
                Document::new(format!("용어{i} : {}", "설명 ".repeat(200)))
                    .with_meta("term", format!("용어{i}"))
            })
            .collect();
        collection.add_documents(&long_docs).await.unwrap();
        let retriever = retriever(registry);

        let context = retriever.search("용어 정의 설명", Category::Term, 3).await;
        let snippet_lines: Vec<&str> = context
            .lines()
            .filter(|line| line.starts_with('['))
            .collect();
        assert!(snippet_lines.len() <= 3);
        for line in snippet_lines {
            // "[i] " prefix plus a 200-char slice.
            assert!(line.chars().count() <= 204, "snippet too long: {line}");
        }
    }

    #[tokio::test]
    async fn max_docs_is_hard_capped_at_three() {
        let dir = tempfile::tempdir().unwrap();
        let registry = toy_registry(dir.path());
        let collection = registry.file_collection(Category::Term).await.unwrap();
        let docs: Vec<Document> = (0..8)
            .map(|i| Document::new(format!("항목{i} : 서로 다른 내용 {i}")).with_meta("term", format!("항목{i}")))
            .collect();
        collection.add_documents(&docs).await.unwrap();
        let retriever = retriever(registry);

        let context = retriever.search("용어 정의 개념", Category::Term, 10).await;
        let snippets = context.lines().filter(|l| l.starts_with('[')).count();
        assert!(snippets <= 3);
    }

    #[test]
    fn fifo_cache_evicts_oldest() {
        let mut cache = FifoCache::new(2);
        cache.insert((Category::Law, 1), "a".into());
        cache.insert((Category::Law, 2), "b".into());
        cache.insert((Category::Law, 3), "c".into());

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&(Category::Law, 1)).is_none());
        assert_eq!(cache.get(&(Category::Law, 3)).as_deref(), Some("c"));
    }

    #[test]
    fn merge_prefers_self_query_and_dedupes() {
        let a = Document::new("공통 본문입니다").with_meta("term", "a");
        let b = Document::new("다른 본문입니다").with_meta("term", "b");
        let merged = merge_dedupe(vec![a.clone()], vec![a.clone(), b.clone()], 3);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].meta("term"), "a");
        assert_eq!(merged[1].meta("term"), "b");
    }

    #[test]
    fn trigger_rule_counts_keywords_and_years() {
        let dir = tempfile::tempdir().unwrap();
        let registry = toy_registry(dir.path());
        let retriever = retriever(registry);

        // Two keyword triggers (대법원 and its 법원 substring) plus a year.
        assert!(retriever.should_use_self_query("대법원 2019 판결", Category::Precedent));
        // One short keyword only.
        assert!(!retriever.should_use_self_query("판결 요지", Category::Precedent));
        // Long queries trigger regardless of keywords.
        let long = "이 질문은 삼십자를 넘기기 위해 일부러 길게 작성한 문장입니다 맞죠";
        assert!(retriever.should_use_self_query(long, Category::Term));
    }
}
