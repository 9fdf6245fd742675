//! Batch scheduling with adaptive pacing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use memoflow_config::{LockSettings, SchedulerSettings};
use memoflow_core::{ErrorCategory, ProcessingError, Result};
use memoflow_db::{JobStats, JobStore};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::circuit::{CircuitBreaker, CircuitSnapshot};
use crate::lock::LockManager;
use crate::orchestrator::{Orchestrator, ProcessResult};

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchMetrics {
    pub elapsed_ms: u64,
    pub error_categories: BTreeMap<ErrorCategory, u32>,
    pub error_rate: f64,
    /// A circuit was open at some point during the batch.
    pub circuit_open: bool,
}

/// Summary of one batch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub processed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub errors: Vec<String>,
    pub metrics: BatchMetrics,
}

impl BatchReport {
    fn record(&mut self, result: &ProcessResult) {
        if result.success {
            self.processed += 1;
            return;
        }
        let message = result.error.as_deref().unwrap_or("unknown error");
        self.errors.push(format!("job {}: {}", result.job_id, message));
        if result.non_fatal {
            self.skipped += 1;
            return;
        }
        self.failed += 1;
        let category = result.error_category.unwrap_or(ErrorCategory::Other);
        *self.metrics.error_categories.entry(category).or_insert(0) += 1;
    }

    /// Failed share of the jobs actually run so far.
    pub fn error_rate(&self) -> f64 {
        let attempted = self.processed + self.failed;
        if attempted == 0 {
            0.0
        } else {
            self.failed as f64 / attempted as f64
        }
    }

    /// Whether any job ran to success or failure.
    pub fn made_progress(&self) -> bool {
        self.processed + self.failed > 0
    }
}

/// Health snapshot for operators.
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    pub circuit_breakers: Vec<CircuitSnapshot>,
    pub success_rate: f64,
    pub stuck_job_count: u64,
    pub jobs: JobStats,
}

/// Delay before the next job: the base delay, stretched while a circuit is
/// open or (otherwise) while the error rate is above the threshold.
pub fn adaptive_delay(settings: &SchedulerSettings, error_rate: f64, circuit_open: bool) -> Duration {
    let multiplier = if circuit_open {
        settings.circuit_open_multiplier
    } else if error_rate > settings.error_rate_threshold {
        settings.degraded_multiplier
    } else {
        1.0
    };
    let secs = settings.base_delay.as_secs_f64() * multiplier.max(0.0);
    if !secs.is_finite() || secs >= settings.max_delay.as_secs_f64() {
        return settings.max_delay;
    }
    Duration::from_secs_f64(secs)
}

pub struct BatchScheduler {
    store: Arc<dyn JobStore>,
    locks: Arc<LockManager>,
    orchestrator: Arc<Orchestrator>,
    breaker: Arc<CircuitBreaker>,
    settings: SchedulerSettings,
    lock: LockSettings,
}

impl BatchScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        locks: Arc<LockManager>,
        orchestrator: Arc<Orchestrator>,
        settings: SchedulerSettings,
        lock: LockSettings,
    ) -> Self {
        let breaker = orchestrator.breaker().clone();
        Self {
            store,
            locks,
            orchestrator,
            breaker,
            settings,
            lock,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Sweep abandoned locks, then run up to `size` eligible jobs in
    /// scheduling order.
    ///
    /// Only a failure to list jobs is an error; per-job failures end up in
    /// the report.
    pub async fn process_next_batch(&self, size: usize) -> Result<BatchReport> {
        let started = Instant::now();

        if let Err(e) = self
            .locks
            .cleanup_abandoned(self.lock.ttl, self.lock.grace)
            .await
        {
            warn!(error = %e, "Abandoned lock sweep failed");
        }

        let jobs = self
            .store
            .fetch_eligible(size, self.lock.ttl, self.settings.max_job_attempts)
            .await
            .map_err(ProcessingError::from)?;

        let mut report = BatchReport::default();
        if jobs.is_empty() {
            debug!("No eligible jobs");
            return Ok(report);
        }
        info!(count = jobs.len(), "Processing batch");

        let total = jobs.len();
        for (index, job) in jobs.into_iter().enumerate() {
            let Some(lease) = self.locks.acquire(job.id, self.lock.ttl).await else {
                debug!(job_id = %job.id, "Job taken by another worker, skipping");
                report.skipped += 1;
                continue;
            };

            let result = self.orchestrator.process_leased(lease, false).await;
            report.record(&result);

            let circuit_open = self.breaker.any_open();
            report.metrics.circuit_open |= circuit_open;

            if index + 1 < total {
                let delay = adaptive_delay(&self.settings, report.error_rate(), circuit_open);
                if !delay.is_zero() {
                    debug!(delay_ms = delay.as_millis() as u64, "Pacing before next job");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        report.metrics.error_rate = report.error_rate();
        report.metrics.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            processed = report.processed,
            failed = report.failed,
            skipped = report.skipped,
            elapsed_ms = report.metrics.elapsed_ms,
            "Batch finished"
        );
        Ok(report)
    }

    pub async fn health_metrics(&self) -> Result<HealthMetrics> {
        let jobs = self.store.stats().await.map_err(ProcessingError::from)?;
        let stuck_job_count = self
            .store
            .count_stuck(self.lock.ttl)
            .await
            .map_err(ProcessingError::from)?;
        Ok(HealthMetrics {
            circuit_breakers: self.breaker.snapshot(),
            success_rate: jobs.success_rate(),
            stuck_job_count,
            jobs,
        })
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }
}
