//! Core error taxonomy.
//!
//! Recovery is local wherever a fallback exists (classifier -> rules,
//! LLM -> deterministic); everything else surfaces to the caller through
//! one of these variants so the transport layer can map status codes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("scorer unavailable: {0}")]
    ScorerUnavailable(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("case already closed")]
    CaseClosed,

    #[error("storage error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("model artifact error: {0}")]
    Artifact(String),

    #[error("event bus at subscriber capacity")]
    BusFull,
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Artifact(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Artifact(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
