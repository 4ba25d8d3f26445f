//! Retrying wrapper around an [`ApiClient`].
//!
//! Each attempt acquires a [`RateLimiter`] permit, then runs through the
//! [`CircuitBreaker`] under the request timeout. Throttle responses are
//! reported back to the limiter so every caller slows down together.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::circuit_breaker::{CircuitBreaker, CircuitError};
use super::rate_limit::RateLimiter;
use crate::llm::{ApiClient, ApiError, RawReply, RequestPayload};

/// Attempt budget and delay shape for one logical call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound on the exponential throttle delay
    pub rate_limit_cap: Duration,
    /// Total time one call may spend sleeping between attempts
    pub max_total_wait: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            rate_limit_cap: Duration::from_secs(60),
            max_total_wait: Duration::from_secs(300),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, given that attempt `attempt` failed.
    ///
    /// Throttling backs off exponentially (capped) and never undercuts a
    /// server hint; other transient failures back off linearly.
    pub fn delay_for(&self, attempt: u32, error: &AttemptError) -> Duration {
        match error {
            AttemptError::Api(ApiError::RateLimited { retry_after }) => {
                let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
                let backoff = self.base_delay.saturating_mul(exp).min(self.rate_limit_cap);
                retry_after.map_or(backoff, |hint| hint.max(backoff))
            }
            AttemptError::CircuitOpen { remaining } => (*remaining).max(self.base_delay),
            AttemptError::Api(_) => self.base_delay.saturating_mul(attempt),
        }
    }
}

/// Why a single attempt failed
#[derive(Debug, Clone, thiserror::Error)]
pub enum AttemptError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Circuit open, next trial in {remaining:?}")]
    CircuitOpen { remaining: Duration },
}

impl From<CircuitError<ApiError>> for AttemptError {
    fn from(err: CircuitError<ApiError>) -> Self {
        match err {
            CircuitError::Open { remaining } => AttemptError::CircuitOpen { remaining },
            CircuitError::Inner(e) => AttemptError::Api(e),
        }
    }
}

/// Final outcome of a failed logical call
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("All retries exhausted after {attempts} attempts: {last}")]
    AllRetriesExhausted { attempts: u32, last: Box<AttemptError> },

    #[error("Non-retryable API error: {0}")]
    NonRetryable(ApiError),

    #[error("Cancelled before the call could complete")]
    Cancelled,
}

/// Rate-limited, breaker-guarded, retrying API client
pub struct RetryingClient<C: ApiClient> {
    client: Arc<C>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    throttle_events: AtomicU64,
}

impl<C: ApiClient> RetryingClient<C> {
    pub fn new(client: Arc<C>, limiter: Arc<RateLimiter>, breaker: Arc<CircuitBreaker>, policy: RetryPolicy) -> Self {
        Self {
            client,
            limiter,
            breaker,
            policy,
            throttle_events: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Throttle responses seen by this client.
    pub fn throttle_events(&self) -> u64 {
        self.throttle_events.load(Ordering::SeqCst)
    }

    /// Send `payload`, retrying transient failures within the policy.
    ///
    /// Cancellation is honoured while waiting for a permit or sleeping
    /// between attempts; an attempt that has started runs to completion.
    pub async fn send(&self, payload: &RequestPayload, cancel: &CancellationToken) -> Result<RawReply, SendError> {
        let mut attempt = 0u32;
        let mut waited = Duration::ZERO;

        loop {
            attempt += 1;

            let error = match self.attempt(payload, cancel).await {
                Some(Ok(reply)) => return Ok(reply),
                Some(Err(err)) => err,
                None => return Err(SendError::Cancelled),
            };

            if let AttemptError::Api(ApiError::RateLimited { retry_after }) = &error {
                self.throttle_events.fetch_add(1, Ordering::SeqCst);
                self.limiter.record_throttled(*retry_after);
            }

            let error = match error {
                AttemptError::Api(api) if !api.is_retryable() => {
                    log::warn!("Non-retryable API error on attempt {}: {}", attempt, api);
                    return Err(SendError::NonRetryable(api));
                }
                other => other,
            };

            let delay = self.policy.delay_for(attempt, &error);
            if attempt >= self.policy.max_attempts || waited + delay > self.policy.max_total_wait {
                log::warn!("Giving up after {} attempts ({:?} waited): {}", attempt, waited, error);
                return Err(SendError::AllRetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            log::debug!("Attempt {} failed ({}), retrying in {:?}", attempt, error, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(SendError::Cancelled),
            }
            waited += delay;
        }
    }

    /// One permit-guarded attempt. `None` means cancelled before starting.
    async fn attempt(&self, payload: &RequestPayload, cancel: &CancellationToken) -> Option<Result<RawReply, AttemptError>> {
        let _permit = self.limiter.acquire(cancel).await?;

        let timeout = payload.timeout.unwrap_or(self.policy.request_timeout);
        let call = async {
            match tokio::time::timeout(timeout, self.client.send(payload)).await {
                Ok(result) => result,
                Err(_) => Err(ApiError::Timeout),
            }
        };

        Some(self.breaker.call_filtered(call, ApiError::trips_breaker).await.map_err(AttemptError::from))
    }
}
