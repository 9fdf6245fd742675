//! Retry with exponential backoff and jitter.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use memoflow_config::RetrySettings;
use memoflow_core::{ErrorClassifier, ProcessingError, Result};
use rand::Rng;
use tracing::{debug, warn};

use crate::circuit::{Admission, CircuitBreaker};

/// How one call site retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: Duration,
    pub classifier: ErrorClassifier,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), jitter excluded.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Backoff plus a random jitter in `[0, jitter]`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        (self.backoff(attempt) + jitter).min(self.max_delay)
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_attempts: s.max_attempts,
            base_delay: s.base_delay,
            max_delay: s.max_delay,
            multiplier: s.multiplier,
            jitter: s.jitter,
            classifier: ErrorClassifier::new(s.retryable.clone(), s.max_attempts),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

/// Result of a retried call.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
    pub total_delay: Duration,
}

/// Runs operations under a [`RetryPolicy`], optionally gated by a circuit
/// breaker.
#[derive(Clone, Default)]
pub struct RetryExecutor {
    breaker: Option<Arc<CircuitBreaker>>,
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_breaker(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            breaker: Some(breaker),
        }
    }

    /// Call `operation` until it succeeds, fails with a non-retryable
    /// error, or runs out of attempts.
    ///
    /// With a `circuit_key` (and a breaker configured) the circuit is checked
    /// before each attempt and the final outcome is recorded into it. A
    /// sequence admitted as the half-open trial holds the trial slot until it
    /// finishes.
    pub async fn with_retry<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        circuit_key: Option<&str>,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = circuit_key.and_then(|key| self.breaker.as_deref().map(|b| (key, b)));
        let max_attempts = policy.max_attempts.max(1);
        let mut attempts = 0;
        let mut total_delay = Duration::ZERO;
        let mut admission: Option<Admission<'_>> = None;

        loop {
            if let Some((key, breaker)) = breaker {
                let admitted = if admission.is_none() {
                    admission = breaker.admit(key);
                    admission.is_some()
                } else {
                    admission.as_ref().is_some_and(|held| held.still_admitted())
                };
                if !admitted {
                    return RetryOutcome {
                        result: Err(ProcessingError::CircuitOpen(key.to_string())),
                        attempts,
                        total_delay,
                    };
                }
            }

            attempts += 1;
            let err = match operation().await {
                Ok(value) => {
                    if let Some(admission) = admission.take() {
                        admission.succeeded();
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                        total_delay,
                    };
                }
                Err(e) => e,
            };

            if attempts >= max_attempts || !policy.classifier.should_retry(&err, attempts) {
                debug!(attempts, error = %err, "Giving up");
                if let Some(admission) = admission.take() {
                    admission.failed();
                }
                return RetryOutcome {
                    result: Err(err),
                    attempts,
                    total_delay,
                };
            }

            let delay = policy.delay_for(attempts);
            warn!(
                attempt = attempts,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after failure"
            );
            tokio::time::sleep(delay).await;
            total_delay += delay;
        }
    }
}
