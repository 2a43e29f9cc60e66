use thiserror::Error;
use uuid::Uuid;

/// A record failed validation during normalization. The record is dropped
/// and counted against the run; other records are unaffected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("validation failed on '{field}': {reason}")]
pub struct ValidationFailure {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationFailure {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Adapter-level fetch failure. Transient failures are retried with backoff;
/// permanent failures mark the source failed for the current run.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("transient fetch failure: {0}")]
    Transient(String),

    #[error("permanent fetch failure: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

#[derive(Error, Debug)]
pub enum FestcalError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Validation(#[from] ValidationFailure),

    #[error("write conflict on canonical event {canonical_id}")]
    StoreConflict { canonical_id: Uuid },

    #[error("store error: {message}")]
    Store { message: String },
}

pub type Result<T> = std::result::Result<T, FestcalError>;
