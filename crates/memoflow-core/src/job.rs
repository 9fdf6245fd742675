//! The job record.
//!
//! A job carries one recorded-audio payload through transcription and
//! analysis. Its lock is not a separate entity: it is the `locked_at`
//! timestamp plus the configured TTL, and `lock_generation` is bumped every
//! time a new holder takes it.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::AnalysisResult;
use crate::classify::ErrorCategory;
use crate::id::{JobId, OwnerId};

/// A recording waiting for (or done with) processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_id: OwnerId,
    /// Key understood by the payload storage collaborator.
    pub payload_ref: String,
    /// Higher is more important. Used as the last scheduling tie-break.
    pub priority: i32,
    pub expected_duration_secs: Option<i32>,
    pub recorded_at: DateTime<Utc>,
    /// Number of failed processing attempts.
    pub attempts: u32,
    pub locked_at: Option<DateTime<Utc>>,
    /// Fencing token; bumped on every successful lock acquisition.
    pub lock_generation: i64,
    pub transcript: Option<String>,
    pub analysis: Option<AnalysisResult>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_category: Option<ErrorCategory>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Convert a std duration into a chrono one, saturating on overflow.
pub fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(52 * 1000))
}

impl Job {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Age of the current lock, if any.
    pub fn lock_age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.locked_at.map(|at| now - at)
    }

    /// A job is locked while its lock timestamp is no older than `ttl`.
    pub fn is_locked(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.lock_age(now)
            .is_some_and(|age| age <= chrono_duration(ttl))
    }

    /// Whether the lock exists but has outlived `older_than`.
    pub fn lock_older_than(&self, older_than: Duration, now: DateTime<Utc>) -> bool {
        self.lock_age(now)
            .is_some_and(|age| age > chrono_duration(older_than))
    }

    /// Whether a scheduler may pick this job up.
    pub fn is_eligible(&self, ttl: Duration, max_attempts: u32, now: DateTime<Utc>) -> bool {
        !self.is_completed() && !self.is_locked(ttl, now) && self.attempts < max_attempts
    }

    /// Batch ordering: fresh jobs before retried ones, then oldest recording,
    /// then shortest expected duration (unknown last), then highest priority.
    pub fn schedule_cmp(&self, other: &Job) -> Ordering {
        self.attempts
            .cmp(&other.attempts)
            .then_with(|| self.recorded_at.cmp(&other.recorded_at))
            .then_with(|| {
                match (self.expected_duration_secs, other.expected_duration_secs) {
                    (Some(a), Some(b)) => a.cmp(&b),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            })
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// A job to be enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub owner_id: OwnerId,
    pub payload_ref: String,
    pub priority: i32,
    pub expected_duration_secs: Option<i32>,
    pub recorded_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(owner_id: OwnerId, payload_ref: impl Into<String>) -> Self {
        Self {
            owner_id,
            payload_ref: payload_ref.into(),
            priority: 0,
            expected_duration_secs: None,
            recorded_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_expected_duration(mut self, secs: i32) -> Self {
        self.expected_duration_secs = Some(secs);
        self
    }

    pub fn recorded_at(mut self, at: DateTime<Utc>) -> Self {
        self.recorded_at = Some(at);
        self
    }

    /// Materialize the job record as it looks right after enqueueing.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            owner_id: self.owner_id,
            payload_ref: self.payload_ref,
            priority: self.priority,
            expected_duration_secs: self.expected_duration_secs,
            recorded_at: self.recorded_at.unwrap_or(now),
            attempts: 0,
            locked_at: None,
            lock_generation: 0,
            transcript: None,
            analysis: None,
            completed_at: None,
            last_error: None,
            last_error_category: None,
            last_error_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
