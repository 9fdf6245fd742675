//! Database error types.

use memoflow_core::{JobId, ProcessingError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("lease on job {job_id} is stale (generation {generation})")]
    StaleLock { job_id: JobId, generation: i64 },

    #[error("corrupt row: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for ProcessingError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => ProcessingError::NotFound(msg),
            DbError::StaleLock { job_id, generation } => {
                ProcessingError::StaleLock { job_id, generation }
            }
            other => ProcessingError::Persistence(other.to_string()),
        }
    }
}
