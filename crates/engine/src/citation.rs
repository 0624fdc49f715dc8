//! Korean court case-number extraction and matching.
//!
//! Case numbers look like `2019다12345` or `92도2077`: a 2–4 digit year, a
//! chamber syllable, an optional 단/합 marker and a serial. Queries often
//! prefix the court (`대법원 2019다12345`); the court is captured when
//! present and canonicalized through the alias map.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Chamber syllables that appear in traffic-related case numbers.
const CHAMBER: &str = "[가나다도마바사아자차카타파하]";

/// Ordered extraction rules. Court-prefixed forms first so the bare-core
/// rule cannot shadow them; the first rule that matches a span wins.
static CASE_NUMBER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    let core = format!(r"\d{{2,4}}{CHAMBER}[단합]?\d+");
    [
        format!(r"(대법원)\s*({core})"),
        format!(r"(서울고등법원|서울고법)\s*({core})"),
        format!(r"(서울중앙지방법원|서울지방법원)\s*({core})"),
        format!(r"([가-힣]{{2,6}}(?:고등법원|지방법원|고법|지법))\s*({core})"),
        format!(r"({core})"),
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("case-number pattern"))
    .collect()
});

static CASE_CORE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\d{{2,4}}{CHAMBER}[단합]?\d+")).expect("case-core pattern")
});

/// Canonical court name to aliases, most specific first. Detection returns
/// the canonical name of the first alias found as a substring.
const COURT_ALIASES: &[(&str, &[&str])] = &[
    ("서울중앙지방법원", &["서울중앙지방법원", "서울중앙지법"]),
    ("서울고등법원", &["서울고등법원", "서울고법"]),
    ("서울지방법원", &["서울지방법원", "서울지법"]),
    ("부산지방법원", &["부산지방법원", "부산지법"]),
    ("수원지방법원", &["수원지방법원", "수원지법"]),
    ("대법원", &["대법원"]),
];

/// A recognized precedent citation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Citation {
    /// The span as it appeared in the query (court prefix included).
    pub raw: String,
    pub court: Option<String>,
    /// The case-number core, e.g. `2019다12345`.
    pub case_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct CitationExtractor;

impl CitationExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract all citations, first-occurrence order, duplicates (by
    /// normalized case id) removed.
    pub fn extract(&self, query: &str) -> Vec<Citation> {
        let mut citations: Vec<Citation> = Vec::new();

        for pattern in CASE_NUMBER_PATTERNS.iter() {
            for captures in pattern.captures_iter(query) {
                let raw = captures.get(0).map(|m| m.as_str().trim()).unwrap_or("");
                // The bare-core rule has one group; prefixed rules have two.
                let (court, case_id) = match (captures.get(2), captures.get(1)) {
                    (Some(case), Some(court)) => {
                        (canonical_court(court.as_str()), case.as_str())
                    }
                    (None, Some(case)) => (None, case.as_str()),
                    _ => continue,
                };

                let normalized = normalize(case_id);
                if citations
                    .iter()
                    .any(|existing| normalize(&existing.case_id) == normalized)
                {
                    continue;
                }
                citations.push(Citation {
                    raw: raw.to_string(),
                    court,
                    case_id: case_id.to_string(),
                });
            }
        }

        citations
    }

    /// Canonical court name mentioned anywhere in the query.
    pub fn detect_court(&self, query: &str) -> Option<&'static str> {
        let folded = query.to_lowercase();
        for (canonical, aliases) in COURT_ALIASES {
            for alias in *aliases {
                if folded.contains(&alias.to_lowercase()) {
                    return Some(canonical);
                }
            }
        }
        None
    }

    /// Exact match: normalized forms equal, or one contains the other
    /// (covers court-prefixed vs bare spellings of the same number).
    pub fn is_exact_match(&self, a: &str, b: &str) -> bool {
        let na = normalize(a);
        let nb = normalize(b);
        if na.is_empty() || nb.is_empty() {
            return false;
        }
        na == nb || na.contains(&nb) || nb.contains(&na)
    }

    /// Partial match: the year+chamber+serial cores agree even though the
    /// surrounding text differs.
    pub fn is_partial_match(&self, a: &str, b: &str) -> bool {
        match (extract_core(a), extract_core(b)) {
            (Some(ca), Some(cb)) => ca.to_lowercase() == cb.to_lowercase(),
            _ => false,
        }
    }
}

/// Normalization: drop whitespace and punctuation, case-fold. Only letters
/// (Hangul included) and digits survive.
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|ch| ch.is_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

fn extract_core(value: &str) -> Option<String> {
    CASE_CORE
        .find(&normalize(value))
        .map(|m| m.as_str().to_string())
}

fn canonical_court(raw: &str) -> Option<String> {
    for (canonical, aliases) in COURT_ALIASES {
        if aliases.iter().any(|alias| *alias == raw) {
            return Some((*canonical).to_string());
        }
    }
    // A court form matched by the generic rule but absent from the alias
    // table is kept verbatim.
    Some(raw.to_string())
}
