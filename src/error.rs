//! Error handling

use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors surfaced by the ingestion and retention pipeline.
///
/// Rule predicate failures and explanation provider failures are handled
/// internally (logged / recovered with fallbacks) and never reach callers
/// as errors; only storage and archival problems propagate.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("not found: {0}")]
    NotFound(String),
}
