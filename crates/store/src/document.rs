use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The five query kinds the pipeline routes by. Closed set; everything the
/// classifier cannot place lands in `General`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Accident,
    Precedent,
    Law,
    Term,
    General,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Accident,
        Category::Precedent,
        Category::Law,
        Category::Term,
        Category::General,
    ];

    /// Categories that are backed by a vector collection.
    pub const INDEXED: [Category; 4] = [
        Category::Accident,
        Category::Precedent,
        Category::Law,
        Category::Term,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Accident => "accident",
            Category::Precedent => "precedent",
            Category::Law => "law",
            Category::Term => "term",
            Category::General => "general",
        }
    }

    pub fn parse(value: &str) -> Option<Category> {
        match value.trim().to_lowercase().as_str() {
            "accident" => Some(Category::Accident),
            "precedent" => Some(Category::Precedent),
            "law" => Some(Category::Law),
            "term" => Some(Category::Term),
            "general" => Some(Category::General),
            _ => None,
        }
    }

    /// Physical collection name. A pure function of the category; the names
    /// match the original corpus files they were built from.
    pub fn collection_name(self) -> Option<&'static str> {
        match self {
            Category::Accident => Some("car_case"),
            Category::Precedent => Some("precedent"),
            Category::Law => Some("traffic_law_rag"),
            Category::Term => Some("term"),
            Category::General => None,
        }
    }

    /// User-facing Korean label.
    pub fn korean_name(self) -> &'static str {
        match self {
            Category::Accident => "교통사고 분석",
            Category::Precedent => "판례 검색",
            Category::Law => "도로교통법 조회",
            Category::Term => "용어 설명",
            Category::General => "일반 상담",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable corpus document: text plus flat string metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn meta(&self, key: &str) -> &str {
        self.metadata.get(key).map(String::as_str).unwrap_or("")
    }
}
