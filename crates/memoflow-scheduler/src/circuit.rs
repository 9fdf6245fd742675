//! Per-key circuit breaker.
//!
//! A key's circuit opens once `threshold` failures land inside the rolling
//! `window`. While open every call is rejected with
//! [`ProcessingError::CircuitOpen`]. After `reset_timeout` a single trial call
//! is let through: success closes the circuit, failure re-opens it. The
//! trial slot stays taken for as long as the trial call runs.
//!
//! State is per process. Instants come from `tokio::time` so tests can run
//! with a paused clock.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use memoflow_config::BreakerSettings;
use memoflow_core::{ProcessingError, Result};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of one circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub recent_failures: usize,
    pub open_for_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct Circuit {
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Circuit {
    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn state(&self, reset_timeout: Duration, now: Instant) -> CircuitState {
        match self.opened_at {
            None => CircuitState::Closed,
            Some(opened) if now.duration_since(opened) < reset_timeout => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
        }
    }
}

/// Permission to make one call through a circuit.
///
/// The holder of a half-open trial keeps the slot until it reports an
/// outcome; dropping it unreported frees the slot for the next caller.
pub(crate) struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    key: String,
    trial: bool,
    settled: bool,
}

impl Admission<'_> {
    /// Whether a follow-up call under this admission may still go ahead.
    pub(crate) fn still_admitted(&self) -> bool {
        self.trial || !self.breaker.is_open(&self.key)
    }

    pub(crate) fn succeeded(mut self) {
        self.settled = true;
        self.breaker.reset(&self.key);
    }

    pub(crate) fn failed(mut self) {
        self.settled = true;
        self.breaker.record_failure(&self.key);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            debug!(key = %self.key, "Trial call abandoned, releasing slot");
            if let Some(circuit) = self.breaker.circuits().get_mut(&self.key) {
                circuit.trial_in_flight = false;
            }
        }
    }
}

pub struct CircuitBreaker {
    settings: BreakerSettings,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    fn circuits(&self) -> MutexGuard<'_, HashMap<String, Circuit>> {
        self.circuits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while calls for `key` would be rejected.
    pub fn is_open(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut circuits = self.circuits();
        let Some(circuit) = circuits.get_mut(key) else {
            return false;
        };
        circuit.prune(self.settings.window, now);
        match circuit.state(self.settings.reset_timeout, now) {
            CircuitState::Closed => false,
            CircuitState::Open => true,
            CircuitState::HalfOpen => circuit.trial_in_flight,
        }
    }

    /// Admit a call, claiming the half-open trial slot if that's what lets
    /// it through. `None` means the call must not be made.
    pub(crate) fn admit(&self, key: &str) -> Option<Admission<'_>> {
        let now = Instant::now();
        let mut circuits = self.circuits();
        let circuit = circuits.entry(key.to_string()).or_default();
        let trial = match circuit.state(self.settings.reset_timeout, now) {
            CircuitState::Closed => false,
            CircuitState::Open => return None,
            CircuitState::HalfOpen if circuit.trial_in_flight => return None,
            CircuitState::HalfOpen => {
                info!(key, "Circuit half-open, admitting trial call");
                circuit.trial_in_flight = true;
                true
            }
        };
        Some(Admission {
            breaker: self,
            key: key.to_string(),
            trial,
            settled: false,
        })
    }

    /// Count a failure. A failure while half-open re-opens the circuit.
    pub fn record_failure(&self, key: &str) {
        let now = Instant::now();
        let mut circuits = self.circuits();
        let circuit = circuits.entry(key.to_string()).or_default();

        circuit.prune(self.settings.window, now);
        circuit.failures.push_back(now);
        match circuit.state(self.settings.reset_timeout, now) {
            CircuitState::HalfOpen => {
                warn!(key, "Trial call failed, circuit re-opened");
                circuit.trial_in_flight = false;
                circuit.opened_at = Some(now);
            }
            CircuitState::Closed if circuit.failures.len() >= self.settings.threshold as usize => {
                warn!(key, failures = circuit.failures.len(), "Circuit opened");
                circuit.opened_at = Some(now);
            }
            _ => {}
        }
    }

    /// Close the circuit and forget its failures.
    pub fn reset(&self, key: &str) {
        let mut circuits = self.circuits();
        if let Some(circuit) = circuits.get_mut(key) {
            if circuit.opened_at.is_some() {
                info!(key, "Circuit closed");
            }
            *circuit = Circuit::default();
        }
    }

    /// Run `operation` unless the circuit for `key` is open.
    pub async fn execute<T, F, Fut>(&self, key: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(admission) = self.admit(key) else {
            return Err(ProcessingError::CircuitOpen(key.to_string()));
        };
        match operation().await {
            Ok(value) => {
                admission.succeeded();
                Ok(value)
            }
            Err(e) => {
                admission.failed();
                Err(e)
            }
        }
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let now = Instant::now();
        let mut circuits = self.circuits();
        let mut snapshots: Vec<CircuitSnapshot> = circuits
            .iter_mut()
            .map(|(key, circuit)| {
                circuit.prune(self.settings.window, now);
                CircuitSnapshot {
                    key: key.clone(),
                    state: circuit.state(self.settings.reset_timeout, now),
                    recent_failures: circuit.failures.len(),
                    open_for_ms: circuit
                        .opened_at
                        .map(|opened| now.duration_since(opened).as_millis() as u64),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Whether any circuit is currently open or half-open.
    pub fn any_open(&self) -> bool {
        let now = Instant::now();
        self.circuits()
            .values()
            .any(|c| c.state(self.settings.reset_timeout, now) != CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoflow_core::ErrorCategory;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerSettings {
            threshold: 3,
            window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
        })
    }

    async fn fail(breaker: &CircuitBreaker, key: &str) -> Result<()> {
        breaker
            .execute(key, || async {
                Err(ProcessingError::provider(ErrorCategory::Provider, "boom"))
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_rejects() {
        let breaker = breaker();
        for _ in 0..3 {
            assert!(fail(&breaker, "analysis").await.is_err());
        }
        assert!(breaker.is_open("analysis"));
        assert!(breaker.any_open());

        let calls = AtomicU32::new(0);
        let result = breaker
            .execute("analysis", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ProcessingError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // other keys are unaffected
        assert!(!breaker.is_open("transcription"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let breaker = breaker();
        fail(&breaker, "k").await.unwrap_err();
        fail(&breaker, "k").await.unwrap_err();
        tokio::time::advance(Duration::from_secs(61)).await;
        fail(&breaker, "k").await.unwrap_err();
        assert!(!breaker.is_open("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_reset_timeout() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure("k");
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!breaker.is_open("k"));

        // first caller claims the trial; a concurrent second caller is rejected
        let trial = breaker.admit("k").unwrap();
        assert!(trial.trial);
        assert!(breaker.is_open("k"));
        assert!(breaker.admit("k").is_none());

        trial.succeeded();
        assert!(!breaker.is_open("k"));
        assert!(!breaker.any_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure("k");
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        fail(&breaker, "k").await.unwrap_err();
        assert!(breaker.is_open("k"));

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].state, CircuitState::Open);
        assert_eq!(snapshot[0].open_for_ms, Some(0));

        tokio::time::advance(Duration::from_secs(31)).await;
        breaker.execute("k", || async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.snapshot()[0].state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_trial_keeps_the_slot() {
        let breaker = Arc::new(breaker());
        for _ in 0..3 {
            breaker.record_failure("k");
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        let calls = Arc::new(AtomicU32::new(0));
        let trial = tokio::spawn({
            let breaker = breaker.clone();
            let calls = calls.clone();
            async move {
                breaker
                    .execute("k", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(120)).await;
                        Ok(())
                    })
                    .await
            }
        });
        tokio::task::yield_now().await;

        // well past another reset period, the trial is still running
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let second = breaker
            .execute("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(second, Err(ProcessingError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        trial.await.unwrap().unwrap();
        assert!(!breaker.is_open("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_frees_the_slot() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure("k");
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        let cancelled = tokio::time::timeout(
            Duration::from_secs(5),
            breaker.execute("k", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        )
        .await;
        assert!(cancelled.is_err());

        assert!(!breaker.is_open("k"));
        assert!(breaker.admit("k").is_some_and(|a| a.trial));
    }
}
