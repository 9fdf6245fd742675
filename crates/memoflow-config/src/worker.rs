//! Worker configuration parsing.
//!
//! ```kdl
//! database url="postgres://localhost/memoflow" max-connections=10
//! lock ttl-secs=600 grace-secs=60
//! scheduler batch-size=10 base-delay-ms=500 max-delay-ms=10000 max-job-attempts=5
//! circuit-breaker threshold=5 window-secs=60 reset-timeout-secs=30
//! retry "transcription" max-attempts=3 base-delay-ms=1000 multiplier=2.0 jitter-ms=250
//! retry "analysis" max-attempts=4 {
//!     retryable "rate_limited" "timeout" "network"
//! }
//! providers timeout-secs=120 {
//!     transcription url="https://stt.example.com/v1/transcribe" api-key-env="STT_KEY"
//!     analysis url="https://llm.example.com/v1/analyze" model="small"
//! }
//! storage root="/var/lib/memoflow/audio"
//! ```
//!
//! Every section is optional; missing values fall back to the defaults below.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use kdl::{KdlDocument, KdlNode};
use memoflow_core::ErrorCategory;
use serde::{Deserialize, Serialize};

use crate::kdl_ext::*;
use crate::{ConfigError, ConfigResult};

/// Retry settings key used when a stage has no section of its own.
pub const DEFAULT_RETRY_KEY: &str = "default";

/// Top-level worker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub database: DatabaseSettings,
    pub lock: LockSettings,
    pub scheduler: SchedulerSettings,
    pub circuit_breaker: BreakerSettings,
    pub retry: HashMap<String, RetrySettings>,
    pub providers: ProviderSettings,
    pub storage: StorageSettings,
}

impl WorkerConfig {
    /// Retry settings for a stage, falling back to the `default` section.
    pub fn retry_for(&self, stage: &str) -> RetrySettings {
        self.retry
            .get(stage)
            .or_else(|| self.retry.get(DEFAULT_RETRY_KEY))
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    pub ttl: Duration,
    /// Extra slack before the sweep reclaims a lock.
    pub grace: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            grace: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub batch_size: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Running error rate above which the batch slows down.
    pub error_rate_threshold: f64,
    pub degraded_multiplier: f64,
    pub circuit_open_multiplier: f64,
    /// Jobs that failed this many times are no longer picked up.
    pub max_job_attempts: u32,
    pub poll_interval: Duration,
    pub poll_jitter: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            error_rate_threshold: 0.3,
            degraded_multiplier: 2.0,
            circuit_open_multiplier: 4.0,
            max_job_attempts: 5,
            poll_interval: Duration::from_secs(5),
            poll_jitter: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub threshold: u32,
    pub window: Duration,
    pub reset_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: Duration,
    pub retryable: BTreeSet<ErrorCategory>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: Duration::from_millis(250),
            retryable: ErrorCategory::default_retryable(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSettings {
    pub url: String,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
}

impl EndpointSettings {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub transcription: Option<EndpointSettings>,
    pub analysis: Option<EndpointSettings>,
    pub timeout: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            transcription: None,
            analysis: None,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    pub root: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/audio"),
        }
    }
}

/// Read and parse a worker configuration file.
pub fn load_worker_config(path: impl AsRef<Path>) -> ConfigResult<WorkerConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_worker_config(&content)
}

/// Parse a worker configuration from KDL text.
pub fn parse_worker_config(kdl: &str) -> ConfigResult<WorkerConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = WorkerConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "database" => parse_database(node, &mut config.database)?,
            "lock" => parse_lock(node, &mut config.lock)?,
            "scheduler" => parse_scheduler(node, &mut config.scheduler)?,
            "circuit-breaker" => parse_breaker(node, &mut config.circuit_breaker)?,
            "retry" => {
                let stage = get_first_string_arg(node)
                    .unwrap_or_else(|| DEFAULT_RETRY_KEY.to_string());
                if config.retry.contains_key(&stage) {
                    return Err(ConfigError::Duplicate(format!("retry \"{}\"", stage)));
                }
                config.retry.insert(stage, parse_retry(node)?);
            }
            "providers" => parse_providers(node, &mut config.providers)?,
            "storage" => {
                if let Some(root) = get_string_prop(node, "root").or_else(|| get_first_string_arg(node))
                {
                    config.storage.root = PathBuf::from(root);
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    validate(&config)?;
    Ok(config)
}

fn parse_database(node: &KdlNode, db: &mut DatabaseSettings) -> ConfigResult<()> {
    if let Some(url) = get_string_prop(node, "url") {
        db.url = Some(url);
    }
    if let Some(max) = get_u32_prop(node, "max-connections")? {
        db.max_connections = max;
    }
    Ok(())
}

fn parse_lock(node: &KdlNode, lock: &mut LockSettings) -> ConfigResult<()> {
    if let Some(ttl) = get_secs_prop(node, "ttl-secs")? {
        lock.ttl = ttl;
    }
    if let Some(grace) = get_secs_prop(node, "grace-secs")? {
        lock.grace = grace;
    }
    Ok(())
}

fn parse_scheduler(node: &KdlNode, s: &mut SchedulerSettings) -> ConfigResult<()> {
    if let Some(size) = get_u64_prop(node, "batch-size")? {
        s.batch_size = size as usize;
    }
    if let Some(d) = get_millis_prop(node, "base-delay-ms")? {
        s.base_delay = d;
    }
    if let Some(d) = get_millis_prop(node, "max-delay-ms")? {
        s.max_delay = d;
    }
    if let Some(rate) = get_f64_prop(node, "error-rate-threshold")? {
        s.error_rate_threshold = rate;
    }
    if let Some(m) = get_f64_prop(node, "degraded-multiplier")? {
        s.degraded_multiplier = m;
    }
    if let Some(m) = get_f64_prop(node, "circuit-open-multiplier")? {
        s.circuit_open_multiplier = m;
    }
    if let Some(n) = get_u32_prop(node, "max-job-attempts")? {
        s.max_job_attempts = n;
    }
    if let Some(d) = get_millis_prop(node, "poll-interval-ms")? {
        s.poll_interval = d;
    }
    if let Some(d) = get_millis_prop(node, "poll-jitter-ms")? {
        s.poll_jitter = d;
    }
    Ok(())
}

fn parse_breaker(node: &KdlNode, b: &mut BreakerSettings) -> ConfigResult<()> {
    if let Some(t) = get_u32_prop(node, "threshold")? {
        b.threshold = t;
    }
    if let Some(w) = get_secs_prop(node, "window-secs")? {
        b.window = w;
    }
    if let Some(r) = get_secs_prop(node, "reset-timeout-secs")? {
        b.reset_timeout = r;
    }
    Ok(())
}

fn parse_retry(node: &KdlNode) -> ConfigResult<RetrySettings> {
    let mut r = RetrySettings::default();
    if let Some(n) = get_u32_prop(node, "max-attempts")? {
        r.max_attempts = n;
    }
    if let Some(d) = get_millis_prop(node, "base-delay-ms")? {
        r.base_delay = d;
    }
    if let Some(d) = get_millis_prop(node, "max-delay-ms")? {
        r.max_delay = d;
    }
    if let Some(m) = get_f64_prop(node, "multiplier")? {
        r.multiplier = m;
    }
    if let Some(j) = get_millis_prop(node, "jitter-ms")? {
        r.jitter = j;
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "retryable" {
                let mut set = BTreeSet::new();
                for name in get_all_string_args(child) {
                    let category = name
                        .parse::<ErrorCategory>()
                        .map_err(|message| ConfigError::invalid("retry.retryable", message))?;
                    set.insert(category);
                }
                r.retryable = set;
            }
        }
    }
    Ok(r)
}

fn parse_providers(node: &KdlNode, p: &mut ProviderSettings) -> ConfigResult<()> {
    if let Some(t) = get_secs_prop(node, "timeout-secs")? {
        p.timeout = t;
    }
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "transcription" => p.transcription = Some(parse_endpoint(child)?),
                "analysis" => p.analysis = Some(parse_endpoint(child)?),
                _ => {}
            }
        }
    }
    Ok(())
}

fn parse_endpoint(node: &KdlNode) -> ConfigResult<EndpointSettings> {
    let url = get_string_prop(node, "url")
        .or_else(|| get_first_string_arg(node))
        .ok_or_else(|| ConfigError::MissingField(format!("{} url", node.name().value())))?;
    Ok(EndpointSettings {
        url,
        api_key_env: get_string_prop(node, "api-key-env"),
        model: get_string_prop(node, "model"),
    })
}

fn validate(config: &WorkerConfig) -> ConfigResult<()> {
    if config.lock.ttl.is_zero() {
        return Err(ConfigError::invalid("lock.ttl-secs", "must be greater than zero"));
    }
    let s = &config.scheduler;
    if s.batch_size == 0 {
        return Err(ConfigError::invalid("scheduler.batch-size", "must be greater than zero"));
    }
    if !(0.0..=1.0).contains(&s.error_rate_threshold) {
        return Err(ConfigError::invalid(
            "scheduler.error-rate-threshold",
            "must be between 0 and 1",
        ));
    }
    if s.degraded_multiplier < 1.0 || s.circuit_open_multiplier < 1.0 {
        return Err(ConfigError::invalid("scheduler", "delay multipliers must be >= 1"));
    }
    if s.max_delay < s.base_delay {
        return Err(ConfigError::invalid(
            "scheduler.max-delay-ms",
            "must not be smaller than base-delay-ms",
        ));
    }
    if s.max_job_attempts == 0 {
        return Err(ConfigError::invalid("scheduler.max-job-attempts", "must be at least 1"));
    }
    if config.circuit_breaker.threshold == 0 {
        return Err(ConfigError::invalid("circuit-breaker.threshold", "must be at least 1"));
    }
    for (stage, r) in &config.retry {
        if r.max_attempts == 0 {
            return Err(ConfigError::invalid(
                format!("retry \"{}\".max-attempts", stage),
                "must be at least 1",
            ));
        }
        if r.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                format!("retry \"{}\".multiplier", stage),
                "must be >= 1",
            ));
        }
    }
    Ok(())
}
