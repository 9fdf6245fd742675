//! KDL configuration parsing for memoflow.
//!
//! This crate handles parsing of the worker configuration (`memoflow.kdl`):
//! database, lock TTLs, scheduler pacing, circuit breaker and per-stage
//! retry policies, provider endpoints and payload storage.

pub mod error;
mod kdl_ext;
pub mod worker;

pub use error::{ConfigError, ConfigResult};
pub use worker::{
    BreakerSettings, DatabaseSettings, EndpointSettings, LockSettings, ProviderSettings,
    RetrySettings, SchedulerSettings, StorageSettings, WorkerConfig, load_worker_config,
    parse_worker_config,
};
