//! Error types for memoflow.

use thiserror::Error;

use crate::classify::ErrorCategory;
use crate::id::JobId;

#[derive(Debug, Clone, Error)]
pub enum ProcessingError {
    #[error("job {0} is locked by another worker")]
    LockConflict(JobId),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{category} error from provider: {message}")]
    Provider {
        category: ErrorCategory,
        message: String,
        /// Set when the provider reported itself as temporarily unavailable
        /// (HTTP 502/503/504 and friends).
        service_unavailable: bool,
    },

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("lease on job {job_id} is stale (generation {generation})")]
    StaleLock { job_id: JobId, generation: i64 },

    #[error("storage error: {0}")]
    Storage(String),

    /// An error that crossed an untyped boundary. Only its message is known.
    #[error("{0}")]
    Untyped(String),
}

impl ProcessingError {
    pub fn provider(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self::Provider {
            category,
            message: message.into(),
            service_unavailable: false,
        }
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::Provider {
            category: ErrorCategory::Provider,
            message: message.into(),
            service_unavailable: true,
        }
    }

    pub fn untyped(message: impl std::fmt::Display) -> Self {
        Self::Untyped(message.to_string())
    }

    /// Errors that should not halt a batch nor count against the job.
    pub fn is_non_fatal(&self) -> bool {
        matches!(self, Self::LockConflict(_) | Self::CircuitOpen(_))
    }
}

pub type Result<T> = std::result::Result<T, ProcessingError>;
