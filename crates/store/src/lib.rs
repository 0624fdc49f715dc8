//! Document model, vector collections and the corpus indexer.
//!
//! One collection per knowledge category, each persisted as a JSONL file of
//! `{text, metadata, embedding}` records under the configured persist
//! directory. The JSONL file is the canonical source of truth; records are
//! held in RAM for cosine-similarity ranking.

mod document;
mod error;
mod indexer;
mod registry;
mod vector;

pub use document::{Category, Document};
pub use error::StoreError;
pub use indexer::{CollectionReport, DocumentIndexer, IndexerReport};
pub use registry::CollectionRegistry;
pub use vector::{FileVectorStore, VectorStore, cosine_similarity};
