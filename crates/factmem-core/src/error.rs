//! Error kinds for the memory engine.
//!
//! Storage errors propagate as-is once the open-time integrity check has
//! run; embedding/model/reranker failures are expected to be handled at
//! the call site (extraction and retrieval both degrade gracefully), but
//! the error type still exists so callers that do want to observe the
//! failure can.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MemoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("embedding provider error: {0}")]
    Embedding(String),

    #[error("language model error: {0}")]
    Model(String),

    #[error("database init error: {0}")]
    Init(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}
