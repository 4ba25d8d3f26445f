//! Circuit breaker for the external API.
//!
//! # State Transitions
//! ```text
//! Closed   -> Open:     failure_count >= threshold
//! Open     -> HalfOpen: recovery timeout elapsed (one caller wins the trial call)
//! HalfOpen -> Closed:   trial call succeeds
//! HalfOpen -> Open:     trial call fails
//! ```
//!
//! All reads and writes happen under one mutex, so the Open -> HalfOpen
//! check-and-transition admits exactly one trial call. `failure_count` only
//! resets on success.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting a trial call (ms)
    pub recovery_timeout_ms: u64,
    /// Upper bound on how long one trial call can run (ms). Callers turned away
    /// while a trial call is in flight are told to wait out what is left of it.
    pub trial_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            trial_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout_ms: recovery_timeout.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn with_trial_timeout(mut self, trial_timeout: Duration) -> Self {
        self.trial_timeout_ms = trial_timeout.as_millis() as u64;
        self
    }

    fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    fn trial_timeout(&self) -> Duration {
        Duration::from_millis(self.trial_timeout_ms)
    }
}

/// Error returned by [`CircuitBreaker::call`]
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("Circuit open, next trial in {remaining:?}")]
    Open { remaining: Duration },

    #[error(transparent)]
    Inner(E),
}

/// Snapshot of the breaker for logging and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
    trial_started: Option<Instant>,
}

/// Guards one external attempt at a time; never retries by itself.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<Inner>>,
}

/// Admission ticket for one call. Dropping it without reporting an outcome
/// (the caller's future was cancelled) releases a HalfOpen trial slot.
struct Admission {
    inner: Arc<Mutex<Inner>>,
    trial: bool,
    settled: bool,
}

impl Drop for Admission {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            inner.trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
                trial_started: None,
            })),
        }
    }

    /// Run `operation`, counting every error as a failure.
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        self.call_filtered(operation, |_| true).await
    }

    /// Run `operation`; errors for which `is_failure` is false neither count
    /// toward the threshold nor close the circuit.
    pub async fn call_filtered<F, T, E, P>(&self, operation: F, is_failure: P) -> Result<T, CircuitError<E>>
    where
        F: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut admission = self.admit::<E>()?;

        let result = operation.await;
        admission.settled = true;

        match &result {
            Ok(_) => self.on_success(),
            Err(err) if is_failure(err) => self.on_failure(admission.trial),
            Err(_) => self.on_neutral(admission.trial),
        }

        result.map_err(CircuitError::Inner)
    }

    /// Check-and-transition under the lock.
    fn admit<E>(&self) -> Result<Admission, CircuitError<E>> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let recovery = self.config.recovery_timeout();

        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = inner.last_failure.map(|t| t.elapsed()).unwrap_or(recovery);
                if elapsed < recovery {
                    return Err(CircuitError::Open {
                        remaining: recovery - elapsed,
                    });
                }
                log::info!("Circuit breaker transitioning from Open to HalfOpen");
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                inner.trial_started = Some(Instant::now());
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    let running = inner.trial_started.map(|t| t.elapsed()).unwrap_or_default();
                    return Err(CircuitError::Open {
                        remaining: self.config.trial_timeout().saturating_sub(running),
                    });
                }
                inner.trial_in_flight = true;
                inner.trial_started = Some(Instant::now());
                true
            }
        };

        Ok(Admission {
            inner: self.inner.clone(),
            trial,
            settled: false,
        })
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.state != CircuitState::Closed {
            log::info!("Circuit breaker closed after successful trial call");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.trial_in_flight = false;
    }

    fn on_failure(&self, was_trial: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        if was_trial {
            inner.trial_in_flight = false;
        }

        let reopen = was_trial && inner.state == CircuitState::HalfOpen;
        if reopen || (inner.state == CircuitState::Closed && inner.failure_count >= self.config.failure_threshold) {
            tracing::warn!(
                failure_count = inner.failure_count,
                recovery_timeout_ms = self.config.recovery_timeout_ms,
                "Circuit breaker opening"
            );
            inner.state = CircuitState::Open;
        }
    }

    fn on_neutral(&self, was_trial: bool) {
        if was_trial {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            inner.trial_in_flight = false;
        }
    }

    /// Current state, without triggering the Open -> HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure: inner.last_failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig::new(threshold, Duration::from_millis(recovery_ms)))
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        cb.call(async { Err::<(), _>("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32, CircuitError<&'static str>> {
        cb.call(async { Ok::<_, &'static str>(7) }).await
    }

    #[test]
    fn test_circuit_breaker_config_default() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.recovery_timeout_ms, 30_000);
        assert_eq!(config.trial_timeout_ms, 60_000);
    }

    #[tokio::test]
    async fn test_starts_closed_and_passes_results_through() {
        let cb = breaker(3, 1000);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert!(matches!(fail(&cb).await, Err(CircuitError::Inner("boom"))));
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_skips_operation() {
        let cb = breaker(3, 60_000);
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = cb
            .call(async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await;

        assert!(matches!(result, Err(CircuitError::Open { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 60_000);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 2);
    }

    #[tokio::test]
    async fn test_half_open_after_recovery_timeout_then_closes() {
        let cb = breaker(2, 30);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_without_resetting_count() {
        let cb = breaker(2, 30);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let _ = fail(&cb).await;

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.failure_count, 3);
        assert!(matches!(succeed(&cb).await, Err(CircuitError::Open { .. })));
    }

    #[tokio::test]
    async fn test_only_one_trial_admitted_in_half_open() {
        let cb = Arc::new(breaker(1, 20));
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_cb = cb.clone();
        let trial = tokio::spawn(async move {
            trial_cb
                .call(async {
                    let _ = release_rx.await;
                    Ok::<_, &'static str>(1)
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(matches!(succeed(&cb).await, Err(CircuitError::Open { .. })));

        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap().unwrap(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_rejection_during_trial_reports_time_left_on_it() {
        let config = CircuitBreakerConfig::new(1, Duration::from_millis(20)).with_trial_timeout(Duration::from_secs(5));
        let cb = Arc::new(CircuitBreaker::new(config));
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_cb = cb.clone();
        let trial = tokio::spawn(async move {
            trial_cb
                .call(async {
                    let _ = release_rx.await;
                    Ok::<_, &'static str>(1)
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        match succeed(&cb).await {
            Err(CircuitError::Open { remaining }) => {
                assert!(remaining > Duration::from_secs(4), "remaining was {:?}", remaining);
                assert!(remaining < Duration::from_secs(5));
            }
            other => panic!("expected rejection, got {:?}", other),
        }

        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_trial_releases_slot() {
        let cb = breaker(1, 20);
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let pending = cb.call(std::future::pending::<Result<(), &'static str>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_filtered_errors_do_not_count() {
        let cb = breaker(2, 60_000);
        for _ in 0..5 {
            let result = cb.call_filtered(async { Err::<(), _>("throttled") }, |_| false).await;
            assert!(matches!(result, Err(CircuitError::Inner("throttled"))));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
    }
}
