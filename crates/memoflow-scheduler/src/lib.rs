//! Job scheduling for memoflow.
//!
//! Exactly-once processing of recorded audio: store-level job locks,
//! retries with backoff, per-provider circuit breakers, the per-job pipeline
//! and the batch scheduler that feeds it.

pub mod batch;
pub mod circuit;
pub mod lock;
pub mod orchestrator;
pub mod retry;
pub mod worker;

use std::sync::Arc;

use memoflow_config::WorkerConfig;
use memoflow_db::JobStore;

pub use batch::{BatchMetrics, BatchReport, BatchScheduler, HealthMetrics, adaptive_delay};
pub use circuit::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use lock::{Lease, LockManager};
pub use orchestrator::{
    Collaborators, Orchestrator, OrchestratorSettings, PipelineState, ProcessResult,
};
pub use retry::{RetryExecutor, RetryOutcome, RetryPolicy};
pub use worker::Worker;

/// Wire the lock manager, breaker, orchestrator and batch scheduler from a
/// worker configuration.
pub fn build_scheduler(
    config: &WorkerConfig,
    store: Arc<dyn JobStore>,
    collaborators: Collaborators,
) -> Arc<BatchScheduler> {
    let locks = Arc::new(LockManager::new(store.clone()));
    let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        locks.clone(),
        breaker,
        collaborators,
        OrchestratorSettings::from_config(config),
    ));
    Arc::new(BatchScheduler::new(
        store,
        locks,
        orchestrator,
        config.scheduler.clone(),
        config.lock.clone(),
    ))
}
