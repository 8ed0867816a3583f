//! Error taxonomy shared by the ledger, the pipeline, and the reconciler.
//!
//! Validation, conflict, and not-found errors are surfaced synchronously to
//! callers. External process failures never reach the submitting caller:
//! they are recorded on the task row and observed through status polling.

use thiserror::Error;

use crate::models::Stage;

#[derive(Error, Debug)]
pub enum CrawlError {
    /// Malformed or missing input, rejected before any state mutation.
    #[error("{0}")]
    Validation(String),

    /// The request collides with existing in-flight state.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    /// A pipeline stage exited non-zero or could not be started.
    #[error("{stage} stage failed: {message}")]
    ExternalProcess { stage: Stage, message: String },

    /// One deletion inside a cleanup batch failed.
    #[error("failed to clean {target}: {reason}")]
    PartialCleanup { target: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T, E = CrawlError> = std::result::Result<T, E>;

impl CrawlError {
    /// Map to an HTTP status code for API responses.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            _ => 500,
        }
    }

    /// Machine-readable error code used in the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            _ => "internal",
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}
