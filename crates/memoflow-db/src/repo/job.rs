//! Job repository.
//!
//! All cross-worker coordination happens here, through single conditional
//! `UPDATE` statements on the `jobs` table. A lock is the pair
//! (`locked_at`, `lock_generation`); every write made on behalf of a lock
//! holder is fenced by the generation it was granted.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use memoflow_core::{AnalysisResult, ErrorCategory, Job, JobId, NewJob, OwnerId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// A job row in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    pub id: uuid::Uuid,
    pub owner_id: uuid::Uuid,
    pub payload_ref: String,
    pub priority: i32,
    pub expected_duration_secs: Option<i32>,
    pub recorded_at: DateTime<Utc>,
    pub attempts: i32,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_generation: i64,
    pub transcript: Option<String>,
    pub analysis: Option<serde_json::Value>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_category: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRecord> for Job {
    type Error = DbError;

    fn try_from(r: JobRecord) -> DbResult<Self> {
        let analysis = r
            .analysis
            .map(serde_json::from_value::<AnalysisResult>)
            .transpose()
            .map_err(|e| DbError::Decode(format!("job {} analysis: {}", r.id, e)))?;
        let last_error_category = r
            .last_error_category
            .as_deref()
            .map(str::parse::<ErrorCategory>)
            .transpose()
            .map_err(|e| DbError::Decode(format!("job {}: {}", r.id, e)))?;

        Ok(Job {
            id: JobId::from_uuid(r.id),
            owner_id: OwnerId::from_uuid(r.owner_id),
            payload_ref: r.payload_ref,
            priority: r.priority,
            expected_duration_secs: r.expected_duration_secs,
            recorded_at: r.recorded_at,
            attempts: u32::try_from(r.attempts).unwrap_or(0),
            locked_at: r.locked_at,
            lock_generation: r.lock_generation,
            transcript: r.transcript,
            analysis,
            completed_at: r.completed_at,
            last_error: r.last_error,
            last_error_category,
            last_error_at: r.last_error_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

/// Aggregate counts used for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobStats {
    pub completed: i64,
    /// Incomplete jobs whose last attempt failed.
    pub failed: i64,
    pub pending: i64,
    pub locked: i64,
}

impl JobStats {
    /// completed / (completed + failed); 1.0 when nothing has finished yet.
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            1.0
        } else {
            self.completed as f64 / finished as f64
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> DbResult<Job>;

    async fn get(&self, id: JobId) -> DbResult<Option<Job>>;

    /// Atomically lock an incomplete job whose lock is absent or older than
    /// `ttl`. Returns the new lock generation, or `None` if the condition
    /// did not hold.
    async fn try_lock(&self, id: JobId, ttl: Duration) -> DbResult<Option<i64>>;

    /// Like [`JobStore::try_lock`] but also locks completed jobs.
    async fn force_lock(&self, id: JobId, ttl: Duration) -> DbResult<Option<i64>>;

    /// Clear the lock if it is still held at `generation`.
    /// Returns whether anything was released.
    async fn unlock(&self, id: JobId, generation: i64) -> DbResult<bool>;

    /// Clear the lock, bump the attempt count and record the error, if the
    /// lock is still held at `generation`.
    async fn unlock_with_error(
        &self,
        id: JobId,
        generation: i64,
        message: &str,
        category: ErrorCategory,
    ) -> DbResult<bool>;

    /// Clear every lock older than `older_than`. Returns the number cleared.
    async fn clear_abandoned_locks(&self, older_than: Duration) -> DbResult<u64>;

    /// Incomplete jobs that are unlocked (or whose lock outlived `ttl`) and
    /// have failed fewer than `max_attempts` times, in scheduling order.
    async fn fetch_eligible(
        &self,
        limit: usize,
        ttl: Duration,
        max_attempts: u32,
    ) -> DbResult<Vec<Job>>;

    /// Persist the transcript alone. Fenced by `generation`.
    async fn save_transcript(&self, id: JobId, generation: i64, transcript: &str) -> DbResult<()>;

    /// Persist transcript and analysis, mark completed, clear error fields.
    /// Fenced by `generation`. The lock itself is left in place.
    async fn complete(
        &self,
        id: JobId,
        generation: i64,
        transcript: &str,
        analysis: &AnalysisResult,
    ) -> DbResult<Job>;

    /// Number of locks older than `ttl`.
    async fn count_stuck(&self, ttl: Duration) -> DbResult<u64>;

    async fn stats(&self) -> DbResult<JobStats>;
}

/// PostgreSQL implementation of JobStore.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Distinguish a fenced-out write from a missing job.
    async fn stale_or_missing(&self, id: JobId, generation: i64) -> DbError {
        match self.get(id).await {
            Ok(Some(_)) => DbError::StaleLock {
                job_id: id,
                generation,
            },
            Ok(None) => DbError::NotFound(format!("job {}", id)),
            Err(e) => e,
        }
    }
}

fn secs(d: Duration) -> f64 {
    d.as_secs_f64()
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, job: NewJob) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            INSERT INTO jobs (id, owner_id, payload_ref, priority, expected_duration_secs, recorded_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, COALESCE($6, NOW()), NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(job.owner_id.as_uuid())
        .bind(&job.payload_ref)
        .bind(job.priority)
        .bind(job.expected_duration_secs)
        .bind(job.recorded_at)
        .fetch_one(&self.pool)
        .await?;
        record.try_into()
    }

    async fn get(&self, id: JobId) -> DbResult<Option<Job>> {
        let record = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        record.map(Job::try_from).transpose()
    }

    async fn try_lock(&self, id: JobId, ttl: Duration) -> DbResult<Option<i64>> {
        let generation = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE jobs
            SET locked_at = NOW(), lock_generation = lock_generation + 1, updated_at = NOW()
            WHERE id = $1
              AND completed_at IS NULL
              AND (locked_at IS NULL OR locked_at < NOW() - make_interval(secs => $2))
            RETURNING lock_generation
            "#,
        )
        .bind(id.as_uuid())
        .bind(secs(ttl))
        .fetch_optional(&self.pool)
        .await?;
        Ok(generation)
    }

    async fn force_lock(&self, id: JobId, ttl: Duration) -> DbResult<Option<i64>> {
        let generation = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE jobs
            SET locked_at = NOW(), lock_generation = lock_generation + 1, updated_at = NOW()
            WHERE id = $1
              AND (locked_at IS NULL OR locked_at < NOW() - make_interval(secs => $2))
            RETURNING lock_generation
            "#,
        )
        .bind(id.as_uuid())
        .bind(secs(ttl))
        .fetch_optional(&self.pool)
        .await?;
        Ok(generation)
    }

    async fn unlock(&self, id: JobId, generation: i64) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET locked_at = NULL, updated_at = NOW()
            WHERE id = $1 AND lock_generation = $2 AND locked_at IS NOT NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(generation)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn unlock_with_error(
        &self,
        id: JobId,
        generation: i64,
        message: &str,
        category: ErrorCategory,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET locked_at = NULL,
                attempts = attempts + 1,
                last_error = $3,
                last_error_category = $4,
                last_error_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND lock_generation = $2 AND locked_at IS NOT NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(generation)
        .bind(message)
        .bind(category.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_abandoned_locks(&self, older_than: Duration) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET locked_at = NULL, updated_at = NOW()
            WHERE locked_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(secs(older_than))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_eligible(
        &self,
        limit: usize,
        ttl: Duration,
        max_attempts: u32,
    ) -> DbResult<Vec<Job>> {
        // Candidates only. Ownership is decided by `try_lock`.
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM jobs
            WHERE completed_at IS NULL
              AND attempts < $3
              AND (locked_at IS NULL OR locked_at < NOW() - make_interval(secs => $2))
            ORDER BY attempts ASC,
                     recorded_at ASC,
                     expected_duration_secs ASC NULLS LAST,
                     priority DESC,
                     id ASC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(secs(ttl))
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Job::try_from).collect()
    }

    async fn save_transcript(&self, id: JobId, generation: i64, transcript: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET transcript = $3, updated_at = NOW()
            WHERE id = $1 AND lock_generation = $2 AND locked_at IS NOT NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(generation)
        .bind(transcript)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.stale_or_missing(id, generation).await);
        }
        Ok(())
    }

    async fn complete(
        &self,
        id: JobId,
        generation: i64,
        transcript: &str,
        analysis: &AnalysisResult,
    ) -> DbResult<Job> {
        let analysis = serde_json::to_value(analysis)
            .map_err(|e| DbError::Decode(format!("job {} analysis: {}", id, e)))?;
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs
            SET transcript = $3,
                analysis = $4,
                completed_at = NOW(),
                last_error = NULL,
                last_error_category = NULL,
                last_error_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND lock_generation = $2 AND locked_at IS NOT NULL
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(generation)
        .bind(transcript)
        .bind(analysis)
        .fetch_optional(&self.pool)
        .await?;
        match record {
            Some(record) => record.try_into(),
            None => Err(self.stale_or_missing(id, generation).await),
        }
    }

    async fn count_stuck(&self, ttl: Duration) -> DbResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM jobs WHERE locked_at < NOW() - make_interval(secs => $1)",
        )
        .bind(secs(ttl))
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn stats(&self) -> DbResult<JobStats> {
        let stats = sqlx::query_as::<_, JobStats>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE completed_at IS NOT NULL) AS completed,
                COUNT(*) FILTER (WHERE completed_at IS NULL AND last_error IS NOT NULL) AS failed,
                COUNT(*) FILTER (WHERE completed_at IS NULL AND last_error IS NULL) AS pending,
                COUNT(*) FILTER (WHERE locked_at IS NOT NULL) AS locked
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }
}
