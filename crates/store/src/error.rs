use std::path::PathBuf;

use thiserror::Error;

use crate::document::Category;

#[derive(Debug, Error)]
pub enum StoreError {
    /// `general` queries are not collection-backed; asking for one is a bug
    /// in the caller, not a runtime condition.
    #[error("category {0} has no vector collection")]
    NoCollection(Category),

    #[error("corpus source not found: {0}")]
    MissingSource(PathBuf),

    #[error("invalid corpus JSON in {path}: {message}")]
    InvalidSource { path: PathBuf, message: String },
}
