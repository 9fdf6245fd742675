//! Per-job locks on top of the job store's conditional updates.

use std::sync::Arc;
use std::time::Duration;

use memoflow_core::{ErrorCategory, JobId, ProcessingError, Result};
use memoflow_db::JobStore;
use tracing::{debug, info, warn};

/// Proof of holding a job's lock. The generation fences every write made
/// under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub job_id: JobId,
    pub generation: i64,
}

/// Acquires and releases job locks.
pub struct LockManager {
    store: Arc<dyn JobStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Take the lock if the job is incomplete and unlocked, or its lock is
    /// older than `ttl`. Store failures count as "not acquired".
    pub async fn acquire(&self, job_id: JobId, ttl: Duration) -> Option<Lease> {
        match self.store.try_lock(job_id, ttl).await {
            Ok(Some(generation)) => Some(Self::lease(job_id, generation)),
            Ok(None) => {
                debug!(job_id = %job_id, "Lock not acquired");
                None
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Lock acquisition failed");
                None
            }
        }
    }

    /// Like [`acquire`](Self::acquire) but ignores completion, for
    /// reprocessing a finished job. A live lock is still respected.
    pub async fn acquire_forced(&self, job_id: JobId, ttl: Duration) -> Option<Lease> {
        match self.store.force_lock(job_id, ttl).await {
            Ok(Some(generation)) => {
                info!(job_id = %job_id, generation, "Forced lock acquired");
                Some(Self::lease(job_id, generation))
            }
            Ok(None) => {
                debug!(job_id = %job_id, "Forced lock not acquired");
                None
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Forced lock acquisition failed");
                None
            }
        }
    }

    /// Clear the lock after success. Returns false if the lease was stale.
    pub async fn release(&self, lease: &Lease) -> Result<bool> {
        let released = self
            .store
            .unlock(lease.job_id, lease.generation)
            .await
            .map_err(ProcessingError::from)?;
        if !released {
            warn!(job_id = %lease.job_id, generation = lease.generation, "Release skipped, lease is stale");
        }
        Ok(released)
    }

    /// Clear the lock and record the failure against the job.
    pub async fn release_with_error(
        &self,
        lease: &Lease,
        message: &str,
        category: ErrorCategory,
    ) -> Result<bool> {
        let released = self
            .store
            .unlock_with_error(lease.job_id, lease.generation, message, category)
            .await
            .map_err(ProcessingError::from)?;
        if !released {
            warn!(
                job_id = %lease.job_id,
                generation = lease.generation,
                "Failure not recorded, lease is stale"
            );
        }
        Ok(released)
    }

    /// Clear every lock older than `ttl + grace`.
    pub async fn cleanup_abandoned(&self, ttl: Duration, grace: Duration) -> Result<u64> {
        let cleared = self
            .store
            .clear_abandoned_locks(ttl + grace)
            .await
            .map_err(ProcessingError::from)?;
        if cleared > 0 {
            info!(cleared, "Cleared abandoned locks");
        }
        Ok(cleared)
    }

    fn lease(job_id: JobId, generation: i64) -> Lease {
        Lease { job_id, generation }
    }
}
