//! Run counters, progress reporting and the final summary.
//!
//! One `Metrics` is owned by the orchestrator per run and shared with
//! whatever needs to read it; there are no global counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Metrics {
    started: Instant,
    expected: AtomicU64,
    selected: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    persisted: AtomicU64,
    persist_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub expected: u64,
    pub selected: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Items that reached a terminal outcome
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Completed items per second
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { self.completed() as f64 / secs } else { 0.0 }
    }

    /// Succeeded as a percentage of completed
    pub fn success_rate(&self) -> f64 {
        match self.completed() {
            0 => 0.0,
            n => self.succeeded as f64 / n as f64 * 100.0,
        }
    }

    pub fn percent_complete(&self) -> f64 {
        match self.expected {
            0 => 100.0,
            n => (self.completed() as f64 / n as f64 * 100.0).min(100.0),
        }
    }

    /// Estimated time to finish the expected backlog at the observed rate
    pub fn eta(&self) -> Option<Duration> {
        let remaining = self.expected.saturating_sub(self.completed());
        let rate = self.throughput();
        if remaining == 0 {
            Some(Duration::ZERO)
        } else if rate > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / rate))
        } else {
            None
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            expected: AtomicU64::new(0),
            selected: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
        }
    }

    pub fn set_expected(&self, n: u64) {
        self.expected.store(n, Ordering::Relaxed);
    }

    pub fn add_selected(&self, n: u64) {
        self.selected.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self, n: u64) {
        self.cancelled.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_persisted(&self, n: u64) {
        self.persisted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_persist_failures(&self, n: u64) {
        self.persist_failures.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            expected: self.expected.load(Ordering::Relaxed),
            selected: self.selected.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
        }
    }

    /// One-line progress report
    pub fn progress_line(&self) -> String {
        let snap = self.snapshot();
        let eta = snap.eta().map(format_duration).unwrap_or_else(|| "unknown".to_string());
        format!(
            "Progress: {}/{} ({:.1}%) | {} ok, {} failed | {:.2} items/s | ETA {}",
            snap.completed(),
            snap.expected,
            snap.percent_complete(),
            snap.succeeded,
            snap.failed,
            snap.throughput(),
            eta
        )
    }
}

/// Returned by a completed run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub selected: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Items abandoned by shutdown; left for the next run
    pub cancelled: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub throttle_events: u64,
    pub elapsed: Duration,
    pub throughput: f64,
    pub success_rate: f64,
    pub was_cancelled: bool,
    pub checkpoint_flushed: bool,
}

impl RunSummary {
    pub fn from_snapshot(snap: &MetricsSnapshot, throttle_events: u64, was_cancelled: bool, checkpoint_flushed: bool) -> Self {
        Self {
            selected: snap.selected,
            succeeded: snap.succeeded,
            failed: snap.failed,
            cancelled: snap.cancelled,
            persisted: snap.persisted,
            persist_failures: snap.persist_failures,
            throttle_events,
            elapsed: snap.elapsed,
            throughput: snap.throughput(),
            success_rate: snap.success_rate(),
            was_cancelled,
            checkpoint_flushed,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "selected {}, succeeded {}, failed {}, persisted {}, cancelled {}, throttled {} times, \
             {:.1}% success, {:.2} items/s in {}",
            self.selected,
            self.succeeded,
            self.failed,
            self.persisted,
            self.cancelled,
            self.throttle_events,
            self.success_rate,
            self.throughput,
            format_duration(self.elapsed)
        )
    }
}

/// Render as `1h02m03s`, `2m05s` or `42s`
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h{:02}m{:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m{:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}
