use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::document::{Category, Document};
use crate::error::StoreError;
use crate::registry::CollectionRegistry;
use crate::vector::VectorStore;

/// Source file per indexed category, relative to the metadata directory.
fn source_file(category: Category) -> &'static str {
    match category {
        Category::Accident => "car_to_car.json",
        Category::Precedent => "precedent.json",
        Category::Law => "traffic_law_rag.json",
        Category::Term => "term.json",
        Category::General => unreachable!("general is not indexed"),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionReport {
    pub category: String,
    pub collection: String,
    pub documents: usize,
    /// True when the collection was already populated (or its source was
    /// missing) and nothing was written.
    pub skipped: bool,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct IndexerReport {
    pub collections: Vec<CollectionReport>,
}

/// Builds the vector collections from the JSON corpora. Embeddings are
/// computed in bounded batches; building is idempotent unless forced.
pub struct DocumentIndexer {
    registry: Arc<CollectionRegistry>,
    batch_size: usize,
}

impl DocumentIndexer {
    pub fn new(registry: Arc<CollectionRegistry>, batch_size: usize) -> Self {
        Self {
            registry,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn build(&self, metadata_dir: &Path, force: bool) -> Result<IndexerReport> {
        let mut report = IndexerReport::default();

        for category in Category::INDEXED {
            let collection_name = category.collection_name().unwrap_or_default().to_string();
            let collection = self.registry.file_collection(category).await?;

            let existing = collection.count().await?;
            if existing > 0 && !force {
                info!(%category, existing, "collection already populated, skipping");
                report.collections.push(CollectionReport {
                    category: category.as_str().to_string(),
                    collection: collection_name,
                    documents: existing,
                    skipped: true,
                });
                continue;
            }

            let source = metadata_dir.join(source_file(category));
            if !source.exists() {
                warn!(%category, source = %source.display(), "corpus source missing, skipping");
                report.collections.push(CollectionReport {
                    category: category.as_str().to_string(),
                    collection: collection_name,
                    documents: existing,
                    skipped: true,
                });
                continue;
            }

            if force && existing > 0 {
                collection.clear().await?;
            }

            let docs = load_documents(category, &source)?;
            info!(%category, documents = docs.len(), "indexing corpus");

            for batch in docs.chunks(self.batch_size) {
                collection.add_documents(batch).await?;
            }

            report.collections.push(CollectionReport {
                category: category.as_str().to_string(),
                collection: collection_name,
                documents: collection.count().await?,
                skipped: false,
            });
        }

        Ok(report)
    }
}

fn load_documents(category: Category, path: &Path) -> Result<Vec<Document>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|_| StoreError::MissingSource(path.to_path_buf()))?;
    let value: Value = serde_json::from_str(&raw).map_err(|err| StoreError::InvalidSource {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    let docs = match category {
        Category::Term => convert_terms(&value),
        Category::Precedent => convert_precedents(&value),
        Category::Accident => convert_accident_cases(&value),
        Category::Law => convert_law_articles(&value),
        Category::General => Vec::new(),
    };
    Ok(docs)
}

/// Coerce any JSON value into the flat string form metadata uses: lists are
/// joined, objects serialized, null becomes empty.
fn flat(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Some(Value::Object(_)) => value
            .map(|v| serde_json::to_string(v).unwrap_or_default())
            .unwrap_or_default(),
        Some(other) => other.to_string(),
    }
}

/// term.json: `[{term, desc, category?}]` → `"{term} : {desc}"`.
fn convert_terms(value: &Value) -> Vec<Document> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let term = item.get("term")?.as_str()?;
            let desc = match item.get("desc") {
                Some(Value::Array(lines)) => lines
                    .iter()
                    .filter_map(|line| line.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
                Some(Value::String(s)) => s.clone(),
                _ => return None,
            };

            let mut doc = Document::new(format!("{term} : {desc}")).with_meta("term", term);
            if let Some(cat) = item.get("category").and_then(|v| v.as_str()) {
                doc = doc.with_meta("category", cat);
            }
            Some(doc)
        })
        .collect()
}

/// precedent.json: `[{court, case_id, content}]` →
/// `"{court} {case_id} : {content}"`.
fn convert_precedents(value: &Value) -> Vec<Document> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let court = item.get("court")?.as_str()?;
            let case_id = item.get("case_id")?.as_str()?;
            let content = item.get("content")?.as_str()?;
            Some(
                Document::new(format!("{court} {case_id} : {content}"))
                    .with_meta("court", court)
                    .with_meta("case_id", case_id),
            )
        })
        .collect()
}

/// car_to_car.json: the document text is the whole record; the fault-ratio
/// fields are lifted into metadata. Source keys are the Korean corpus keys.
fn convert_accident_cases(value: &Value) -> Vec<Document> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            if !item.is_object() {
                return None;
            }
            let text = serde_json::to_string(item).ok()?;

            // The explanation column may be a list of lines.
            let reason = match item.get("기본 과실비율 해설") {
                Some(Value::Array(lines)) => lines
                    .iter()
                    .map(|line| match line {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
                other => flat(other),
            };

            Some(
                Document::new(text)
                    .with_meta("case_id", flat(item.get("사건 ID")))
                    .with_meta("title", flat(item.get("사건 제목")))
                    .with_meta("situation", flat(item.get("사고상황")))
                    .with_meta("base_ratio", flat(item.get("기본 과실비율")))
                    .with_meta("modifiers", flat(item.get("케이스별 과실비율 조정예시")))
                    .with_meta("law_references", flat(item.get("관련 법규")))
                    .with_meta("precedent", flat(item.get("참고 판례")))
                    .with_meta("reason", reason),
            )
        })
        .collect()
}

/// traffic_law_rag.json: `{articles: [{id, title, content, subsections}]}`.
/// One document per article, one per subsection (nested subsections
/// included). Article number and name are split out of titles shaped like
/// `제5조(신호 또는 지시에 따를 의무)`.
fn convert_law_articles(value: &Value) -> Vec<Document> {
    let Some(articles) = value.get("articles").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    let mut documents = Vec::new();

    for article in articles {
        let article_id = flat(article.get("id"));
        let article_title = flat(article.get("title"));
        let article_content = flat(article.get("content"));
        let (article_number, article_name) = split_article_title(&article_title);

        documents.push(
            Document::new(format!("{article_title}\n{article_content}"))
                .with_meta("article_id", &article_id)
                .with_meta("article_title", &article_title)
                .with_meta("article_number", &article_number)
                .with_meta("article_name", &article_name),
        );

        let Some(subsections) = article.get("subsections").and_then(|v| v.as_array()) else {
            continue;
        };
        for subsection in subsections {
            push_subsection_doc(
                &mut documents,
                subsection,
                &article_id,
                &article_title,
                &article_number,
                &article_name,
            );
            if let Some(nested) = subsection.get("subsections").and_then(|v| v.as_array()) {
                for inner in nested {
                    push_subsection_doc(
                        &mut documents,
                        inner,
                        &article_id,
                        &article_title,
                        &article_number,
                        &article_name,
                    );
                }
            }
        }
    }

    documents
}

fn push_subsection_doc(
    documents: &mut Vec<Document>,
    subsection: &Value,
    article_id: &str,
    article_title: &str,
    article_number: &str,
    article_name: &str,
) {
    let subsection_id = flat(subsection.get("id"));
    let subsection_title = flat(subsection.get("title"));
    let content = flat(subsection.get("content"));
    let keywords = flat(subsection.get("keywords"));

    let mut text = format!("{subsection_title}\n{content}");
    if let Some(items) = subsection.get("items").and_then(|v| v.as_array()) {
        if !items.is_empty() {
            let listed = items
                .iter()
                .map(|item| format!("- {}", flat(Some(item))))
                .collect::<Vec<_>>()
                .join("\n");
            text.push_str("\n\n세부 내용:\n");
            text.push_str(&listed);
        }
    }

    let mut doc = Document::new(text)
        .with_meta("article_id", article_id)
        .with_meta("article_title", article_title)
        .with_meta("article_number", article_number)
        .with_meta("article_name", article_name)
        .with_meta("subsection_id", subsection_id)
        .with_meta("subsection_title", subsection_title);
    if !keywords.is_empty() {
        doc = doc.with_meta("keywords", keywords);
    }
    documents.push(doc);
}

/// `제5조(신호 또는 지시에 따를 의무)` → (`제5조`, `신호 또는 지시에 따를 의무`).
fn split_article_title(title: &str) -> (String, String) {
    match title.split_once('(') {
        Some((number, rest)) => (
            number.trim().to_string(),
            rest.trim_end_matches(')').trim().to_string(),
        ),
        None => (title.trim().to_string(), String::new()),
    }
}
