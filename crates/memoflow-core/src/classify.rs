//! Error classification.
//!
//! Every failure is mapped onto a fixed category taxonomy, and from there onto
//! a retryability verdict. Typed errors carry their category from the call
//! boundary; free-text matching is only used for [`ProcessingError::Untyped`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ProcessingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimited,
    Timeout,
    Network,
    Auth,
    NotFound,
    Storage,
    Provider,
    Database,
    Other,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 9] = [
        ErrorCategory::RateLimited,
        ErrorCategory::Timeout,
        ErrorCategory::Network,
        ErrorCategory::Auth,
        ErrorCategory::NotFound,
        ErrorCategory::Storage,
        ErrorCategory::Provider,
        ErrorCategory::Database,
        ErrorCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Network => "network",
            ErrorCategory::Auth => "auth",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Provider => "provider",
            ErrorCategory::Database => "database",
            ErrorCategory::Other => "other",
        }
    }

    /// Categories that are worth retrying by default.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCategory::RateLimited | ErrorCategory::Timeout | ErrorCategory::Network
        )
    }

    pub fn default_retryable() -> BTreeSet<ErrorCategory> {
        Self::ALL.into_iter().filter(|c| c.is_transient()).collect()
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown error category: {}", s))
    }
}

/// Verdict for a single failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub service_unavailable: bool,
}

/// Classify a failure into its category.
pub fn classify(err: &ProcessingError) -> Classification {
    match err {
        ProcessingError::Provider {
            category,
            service_unavailable,
            ..
        } => Classification {
            category: *category,
            service_unavailable: *service_unavailable,
        },
        ProcessingError::NotFound(_) => Classification {
            category: ErrorCategory::NotFound,
            service_unavailable: false,
        },
        ProcessingError::Persistence(_) => Classification {
            category: ErrorCategory::Database,
            service_unavailable: false,
        },
        ProcessingError::Storage(_) => Classification {
            category: ErrorCategory::Storage,
            service_unavailable: false,
        },
        ProcessingError::CircuitOpen(_) => Classification {
            category: ErrorCategory::Provider,
            service_unavailable: false,
        },
        ProcessingError::LockConflict(_) | ProcessingError::StaleLock { .. } => Classification {
            category: ErrorCategory::Other,
            service_unavailable: false,
        },
        ProcessingError::Untyped(message) => classify_message(message),
    }
}

/// Fallback classification of a free-text error message.
pub fn classify_message(message: &str) -> Classification {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    let service_unavailable = has(&[
        "service unavailable",
        "temporarily unavailable",
        "bad gateway",
        "gateway timeout",
        "overloaded",
        "503",
        "502",
    ]);

    let category = if has(&["rate limit", "rate-limit", "too many requests", "429", "quota"]) {
        ErrorCategory::RateLimited
    } else if has(&["timeout", "timed out", "deadline exceeded"]) {
        ErrorCategory::Timeout
    } else if has(&[
        "connection",
        "network",
        "econnreset",
        "econnrefused",
        "broken pipe",
        "dns",
        "socket",
    ]) {
        ErrorCategory::Network
    } else if has(&[
        "unauthorized",
        "forbidden",
        "api key",
        "authentication",
        "401",
        "403",
    ]) {
        ErrorCategory::Auth
    } else if has(&["not found", "404", "no such"]) {
        ErrorCategory::NotFound
    } else if has(&["storage", "bucket"]) {
        ErrorCategory::Storage
    } else if has(&["database", "sql", "deadlock", "constraint"]) {
        ErrorCategory::Database
    } else if service_unavailable || has(&["provider", "transcription", "analysis"]) {
        ErrorCategory::Provider
    } else {
        ErrorCategory::Other
    };

    Classification {
        category,
        service_unavailable,
    }
}

/// Decides whether a failed attempt should be retried.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    retryable: BTreeSet<ErrorCategory>,
    attempt_ceiling: u32,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            retryable: ErrorCategory::default_retryable(),
            attempt_ceiling: u32::MAX,
        }
    }
}

impl ErrorClassifier {
    pub fn new(retryable: BTreeSet<ErrorCategory>, attempt_ceiling: u32) -> Self {
        Self {
            retryable,
            attempt_ceiling,
        }
    }

    /// `attempts` is the number of attempts already made.
    pub fn should_retry(&self, err: &ProcessingError, attempts: u32) -> bool {
        if attempts >= self.attempt_ceiling {
            return false;
        }
        let c = classify(err);
        c.service_unavailable || self.retryable.contains(&c.category)
    }
}
