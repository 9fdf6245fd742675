//! In-memory stores for tests and local runs.
//!
//! Every conditional update runs inside one critical section, which gives the
//! same all-or-nothing behaviour as the single-statement updates in
//! [`PgJobStore`](super::PgJobStore).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use memoflow_core::provider::KnowledgeStore;
use memoflow_core::{AnalysisResult, ErrorCategory, Job, JobId, NewJob, OwnerContext, OwnerId};

use super::job::{JobStats, JobStore};
use crate::{DbError, DbResult};

/// In-memory job store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    unavailable: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a job as-is, replacing any job with the same id.
    pub fn insert(&self, job: Job) {
        self.jobs().insert(job.id, job);
    }

    /// Snapshot of a job, bypassing the availability switch.
    pub fn peek(&self, id: JobId) -> Option<Job> {
        self.jobs().get(&id).cloned()
    }

    /// Make every store call fail as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> DbResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DbError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    fn lock_with(
        &self,
        id: JobId,
        ttl: Duration,
        allow_completed: bool,
    ) -> DbResult<Option<i64>> {
        self.check_available()?;
        let now = Utc::now();
        let mut jobs = self.jobs();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if (job.is_completed() && !allow_completed) || job.is_locked(ttl, now) {
            return Ok(None);
        }
        job.locked_at = Some(now);
        job.lock_generation += 1;
        job.updated_at = now;
        Ok(Some(job.lock_generation))
    }

    /// Run `f` on the job if it is still locked at `generation`.
    fn with_held<T>(
        &self,
        id: JobId,
        generation: i64,
        f: impl FnOnce(&mut Job, DateTime<Utc>) -> T,
    ) -> DbResult<Option<T>> {
        self.check_available()?;
        let now = Utc::now();
        let mut jobs = self.jobs();
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        if job.lock_generation != generation || job.locked_at.is_none() {
            return Ok(None);
        }
        job.updated_at = now;
        Ok(Some(f(job, now)))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> DbResult<Job> {
        self.check_available()?;
        let job = job.into_job(Utc::now());
        self.jobs().insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> DbResult<Option<Job>> {
        self.check_available()?;
        Ok(self.jobs().get(&id).cloned())
    }

    async fn try_lock(&self, id: JobId, ttl: Duration) -> DbResult<Option<i64>> {
        self.lock_with(id, ttl, false)
    }

    async fn force_lock(&self, id: JobId, ttl: Duration) -> DbResult<Option<i64>> {
        self.lock_with(id, ttl, true)
    }

    async fn unlock(&self, id: JobId, generation: i64) -> DbResult<bool> {
        match self.with_held(id, generation, |job, _| job.locked_at = None) {
            Ok(released) => Ok(released.is_some()),
            Err(DbError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn unlock_with_error(
        &self,
        id: JobId,
        generation: i64,
        message: &str,
        category: ErrorCategory,
    ) -> DbResult<bool> {
        let released = self.with_held(id, generation, |job, now| {
            job.locked_at = None;
            job.attempts += 1;
            job.last_error = Some(message.to_string());
            job.last_error_category = Some(category);
            job.last_error_at = Some(now);
        });
        match released {
            Ok(released) => Ok(released.is_some()),
            Err(DbError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn clear_abandoned_locks(&self, older_than: Duration) -> DbResult<u64> {
        self.check_available()?;
        let now = Utc::now();
        let mut cleared = 0;
        for job in self.jobs().values_mut() {
            if job.lock_older_than(older_than, now) {
                job.locked_at = None;
                job.updated_at = now;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn fetch_eligible(
        &self,
        limit: usize,
        ttl: Duration,
        max_attempts: u32,
    ) -> DbResult<Vec<Job>> {
        self.check_available()?;
        let now = Utc::now();
        let mut eligible: Vec<Job> = self
            .jobs()
            .values()
            .filter(|j| j.is_eligible(ttl, max_attempts, now))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| a.schedule_cmp(b));
        eligible.truncate(limit);
        Ok(eligible)
    }

    async fn save_transcript(&self, id: JobId, generation: i64, transcript: &str) -> DbResult<()> {
        self.with_held(id, generation, |job, _| {
            job.transcript = Some(transcript.to_string());
        })?
        .ok_or(DbError::StaleLock {
            job_id: id,
            generation,
        })
    }

    async fn complete(
        &self,
        id: JobId,
        generation: i64,
        transcript: &str,
        analysis: &AnalysisResult,
    ) -> DbResult<Job> {
        self.with_held(id, generation, |job, now| {
            job.transcript = Some(transcript.to_string());
            job.analysis = Some(analysis.clone());
            job.completed_at = Some(now);
            job.last_error = None;
            job.last_error_category = None;
            job.last_error_at = None;
            job.clone()
        })?
        .ok_or(DbError::StaleLock {
            job_id: id,
            generation,
        })
    }

    async fn count_stuck(&self, ttl: Duration) -> DbResult<u64> {
        self.check_available()?;
        let now = Utc::now();
        Ok(self
            .jobs()
            .values()
            .filter(|j| j.lock_older_than(ttl, now))
            .count() as u64)
    }

    async fn stats(&self) -> DbResult<JobStats> {
        self.check_available()?;
        let mut stats = JobStats::default();
        for job in self.jobs().values() {
            if job.is_completed() {
                stats.completed += 1;
            } else if job.last_error.is_some() {
                stats.failed += 1;
            } else {
                stats.pending += 1;
            }
            if job.locked_at.is_some() {
                stats.locked += 1;
            }
        }
        Ok(stats)
    }
}

/// In-memory knowledge store.
#[derive(Debug, Default)]
pub struct InMemoryKnowledgeStore {
    contexts: Mutex<HashMap<OwnerId, OwnerContext>>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<OwnerId, OwnerContext>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn context_for(&self, owner_id: OwnerId) -> memoflow_core::Result<OwnerContext> {
        Ok(self
            .contexts()
            .get(&owner_id)
            .cloned()
            .unwrap_or_else(|| OwnerContext::empty(owner_id)))
    }

    async fn record_analysis(
        &self,
        owner_id: OwnerId,
        analysis: &AnalysisResult,
    ) -> memoflow_core::Result<()> {
        self.contexts()
            .entry(owner_id)
            .or_insert_with(|| OwnerContext::empty(owner_id))
            .absorb(analysis, Utc::now());
        Ok(())
    }
}
