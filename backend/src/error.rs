use std::io;

use thiserror::Error;

/// Failures raised by a partitioned store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable for bucket {bucket}: {reason}")]
    Unavailable { bucket: u8, reason: String },
    #[error("bucket {0} is outside the partition range")]
    InvalidBucket(u8),
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
}

/// Per-review failures on the enrichment path.
#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("Error in sentiment analysis: {0}")]
    Analysis(String),
    #[error("invalid review: {0}")]
    InvalidInput(String),
    #[error("failed to store review: {0}")]
    Store(#[from] StoreError),
    #[error("failed to index review: {0}")]
    Index(String),
}

/// Errors surfaced by the HTTP boundary.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}
