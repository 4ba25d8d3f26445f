//! Rate limiting for coordinated call pacing.
//!
//! When the API returns 429 (rate limited), every worker must slow down
//! together to avoid hammering the API. The [`RateLimiter`] combines a
//! counting permit (max in-flight calls) with a shared "last start"
//! watermark (minimum spacing between call starts). Throttle reports grow
//! the spacing multiplicatively up to a ceiling; quiet periods decay it back
//! toward the baseline one step at a time.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Spacing used as the growth base when the baseline is zero.
const MIN_THROTTLE_SPACING: Duration = Duration::from_millis(50);

/// Rate limit configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Max concurrent API calls.
    pub max_concurrent: usize,
    /// Baseline spacing between call starts (ms).
    pub min_spacing_ms: u64,
    /// Ceiling for adaptive spacing (ms).
    pub max_spacing_ms: u64,
    /// Spacing growth factor per throttle event.
    pub throttle_multiplier: f64,
    /// Quiet time with no throttling before one decay step (ms).
    pub quiet_period_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            min_spacing_ms: 0,
            max_spacing_ms: 10_000,
            throttle_multiplier: 2.0,
            quiet_period_ms: 30_000,
        }
    }
}

impl RateLimitConfig {
    /// Create config with custom values.
    pub fn new(max_concurrent: usize, min_spacing_ms: u64, max_spacing_ms: u64) -> Self {
        Self {
            max_concurrent,
            min_spacing_ms,
            max_spacing_ms,
            ..Default::default()
        }
    }

    fn baseline(&self) -> Duration {
        Duration::from_millis(self.min_spacing_ms)
    }

    fn ceiling(&self) -> Duration {
        Duration::from_millis(self.max_spacing_ms.max(self.min_spacing_ms))
    }

    fn multiplier(&self) -> f64 {
        if self.throttle_multiplier > 1.0 { self.throttle_multiplier } else { 2.0 }
    }
}

/// Pacing state shared by all workers, guarded by one mutex.
#[derive(Debug)]
pub struct RateLimitState {
    /// Current spacing between call starts.
    pub spacing: Duration,
    /// Start time reserved by the most recent acquisition.
    pub last_start: Option<Instant>,
    /// Server-requested global pause (from `Retry-After`).
    pub backoff_until: Option<Instant>,
    /// Number of consecutive throttle reports without a decay step.
    pub consecutive_hits: u32,
    /// Last time spacing was raised or decayed.
    pub last_adjusted: Instant,
    /// Total throttle reports over the limiter's lifetime.
    pub throttle_events: u64,
}

impl RateLimitState {
    fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            last_start: None,
            backoff_until: None,
            consecutive_hits: 0,
            last_adjusted: Instant::now(),
            throttle_events: 0,
        }
    }

    /// Step spacing back toward `baseline` once per elapsed quiet period.
    fn decay(&mut self, now: Instant, config: &RateLimitConfig) {
        let baseline = config.baseline();
        let quiet = Duration::from_millis(config.quiet_period_ms.max(1));

        while self.spacing > baseline && now.saturating_duration_since(self.last_adjusted) >= quiet {
            let stepped = self.spacing.div_f64(config.multiplier());
            self.spacing = if stepped < MIN_THROTTLE_SPACING { baseline } else { stepped.max(baseline) };
            self.last_adjusted += quiet;
            self.consecutive_hits = 0;
        }
    }
}

/// Permit held for the duration of one external call.
#[derive(Debug)]
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

/// Concurrency and spacing gate in front of every external call.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    permits: Arc<Semaphore>,
    state: Mutex<RateLimitState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        let state = Mutex::new(RateLimitState::new(config.baseline()));
        Self { config, permits, state }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Wait for a concurrency permit and the next spacing slot.
    ///
    /// Returns `None` if `cancel` fires while waiting; callers must not start
    /// a call in that case.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<RatePermit> {
        if cancel.is_cancelled() {
            return None;
        }

        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit.ok()?,
            _ = cancel.cancelled() => return None,
        };

        let wait = self.reserve_slot(Instant::now());
        if !wait.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return None,
            }
        }

        Some(RatePermit { _permit: permit })
    }

    /// Reserve the next start slot and return how long to wait for it.
    fn reserve_slot(&self, now: Instant) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.decay(now, &self.config);

        let mut start = match state.last_start {
            Some(last) => (last + state.spacing).max(now),
            None => now,
        };
        if let Some(until) = state.backoff_until {
            if until > start {
                start = until;
            } else if until <= now {
                state.backoff_until = None;
            }
        }

        state.last_start = Some(start);
        start.saturating_duration_since(now)
    }

    /// Record a rate-limit response.
    ///
    /// Spacing grows by the configured multiplier (from at least 50ms) up to
    /// the ceiling. A server `retry_after` hint pauses every caller until it
    /// elapses.
    pub fn record_throttled(&self, retry_after: Option<Duration>) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.decay(now, &self.config);

        let grown = state.spacing.max(MIN_THROTTLE_SPACING).mul_f64(self.config.multiplier());
        state.spacing = grown.min(self.config.ceiling());
        state.consecutive_hits += 1;
        state.throttle_events += 1;
        state.last_adjusted = now;

        if let Some(hint) = retry_after {
            let until = now + hint;
            state.backoff_until = Some(state.backoff_until.map_or(until, |u| u.max(until)));
        }

        tracing::warn!(
            spacing_ms = state.spacing.as_millis() as u64,
            consecutive_hits = state.consecutive_hits,
            retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
            "Rate limited, widening call spacing"
        );
    }

    /// Current spacing after applying any pending decay.
    pub fn current_spacing(&self) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.decay(Instant::now(), &self.config);
        state.spacing
    }

    /// Remaining global pause, if a server hint is active.
    pub fn remaining_backoff(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.backoff_until.and_then(|until| {
            let now = Instant::now();
            if now < until { Some(until - now) } else { None }
        })
    }

    /// Total throttle reports recorded.
    pub fn throttle_events(&self) -> u64 {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).throttle_events
    }

    /// Permits currently free.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn limiter(max_concurrent: usize, min_spacing_ms: u64, max_spacing_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig::new(max_concurrent, min_spacing_ms, max_spacing_ms))
    }

    #[test]
    fn test_rate_limit_config_default() {
        let config = RateLimitConfig::default();
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.min_spacing_ms, 0);
        assert_eq!(config.max_spacing_ms, 10_000);
        assert_eq!(config.quiet_period_ms, 30_000);
    }

    #[tokio::test]
    async fn test_consecutive_acquires_respect_spacing() {
        let limiter = limiter(4, 40, 1000);
        let cancel = CancellationToken::new();

        let first = limiter.acquire(&cancel).await.unwrap();
        let t0 = Instant::now();
        drop(first);
        let _second = limiter.acquire(&cancel).await.unwrap();

        assert!(t0.elapsed() >= Duration::from_millis(35));
    }

    #[tokio::test]
    async fn test_concurrent_starts_are_spaced() {
        let limiter = Arc::new(limiter(8, 20, 1000));
        let cancel = CancellationToken::new();
        let starts = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            let starts = starts.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire(&cancel).await.unwrap();
                starts.lock().unwrap().push(Instant::now());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut starts = starts.lock().unwrap().clone();
        starts.sort();
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(10));
        }
    }

    #[tokio::test]
    async fn test_max_concurrent_bounds_in_flight() {
        let limiter = Arc::new(limiter(2, 0, 1000));
        let cancel = CancellationToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire(&cancel).await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(limiter.available_permits(), 2);
    }

    #[test]
    fn test_record_throttled_strictly_increases_spacing() {
        let limiter = limiter(1, 0, 10_000);
        let before = limiter.current_spacing();

        limiter.record_throttled(None);
        let after_one = limiter.current_spacing();
        limiter.record_throttled(None);
        let after_two = limiter.current_spacing();

        assert!(after_one > before);
        assert!(after_two > after_one);
        assert_eq!(limiter.throttle_events(), 2);
    }

    #[test]
    fn test_record_throttled_respects_ceiling() {
        let limiter = limiter(1, 100, 300);

        for _ in 0..10 {
            limiter.record_throttled(None);
        }

        assert_eq!(limiter.current_spacing(), Duration::from_millis(300));
    }

    #[test]
    fn test_spacing_decays_after_quiet_period() {
        let mut config = RateLimitConfig::new(1, 10, 10_000);
        config.quiet_period_ms = 20;
        let limiter = RateLimiter::new(config);

        limiter.record_throttled(None);
        limiter.record_throttled(None);
        let raised = limiter.current_spacing();
        assert!(raised > Duration::from_millis(10));

        thread::sleep(Duration::from_millis(200));

        assert_eq!(limiter.current_spacing(), Duration::from_millis(10));
    }

    #[test]
    fn test_retry_after_sets_global_backoff() {
        let limiter = limiter(1, 0, 1000);
        assert!(limiter.remaining_backoff().is_none());

        limiter.record_throttled(Some(Duration::from_secs(10)));

        let remaining = limiter.remaining_backoff().unwrap();
        assert!(remaining <= Duration::from_secs(10));
        assert!(remaining >= Duration::from_secs(9));
    }

    #[tokio::test]
    async fn test_acquire_observes_cancellation() {
        let limiter = limiter(1, 0, 1000);
        let cancel = CancellationToken::new();

        let _held = limiter.acquire(&cancel).await.unwrap();
        cancel.cancel();

        assert!(limiter.acquire(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff_wait() {
        let limiter = limiter(1, 0, 1000);
        let cancel = CancellationToken::new();
        limiter.record_throttled(Some(Duration::from_secs(30)));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        assert!(limiter.acquire(&cancel).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
