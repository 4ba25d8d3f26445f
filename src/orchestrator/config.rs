//! Engine configuration. Every option has a default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resilience::{CircuitBreakerConfig, RateLimitConfig, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// In-flight external calls
    pub max_concurrent: usize,
    /// Work items selected per slice
    pub batch_size: usize,
    pub request_timeout_ms: u64,
    /// Total attempts per item, the first one included
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Pause between slices
    pub batch_delay_ms: u64,
    /// Terminal outcomes between durable checkpoint writes
    pub checkpoint_interval: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_recovery_timeout_ms: u64,
    pub min_spacing_ms: u64,
    pub max_spacing_ms: u64,
    pub throttle_multiplier: f64,
    pub throttle_quiet_period_ms: u64,
    pub rate_limit_cap_ms: u64,
    pub max_total_wait_ms: u64,
    /// Buffered results that trigger a write
    pub flush_threshold: usize,
    /// Chunk size once a bulk write has failed
    pub write_chunk_size: usize,
    /// Grace for in-flight calls after shutdown
    pub shutdown_grace_ms: u64,
    /// Extra whole-attempt retries after a validation failure
    pub validation_retries: u32,
    /// Cap on items selected per run
    pub max_items: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            batch_size: 20,
            request_timeout_ms: 60_000,
            max_retries: 5,
            retry_base_delay_ms: 1_000,
            batch_delay_ms: 0,
            checkpoint_interval: 10,
            circuit_failure_threshold: 5,
            circuit_recovery_timeout_ms: 30_000,
            min_spacing_ms: 0,
            max_spacing_ms: 10_000,
            throttle_multiplier: 2.0,
            throttle_quiet_period_ms: 30_000,
            rate_limit_cap_ms: 60_000,
            max_total_wait_ms: 300_000,
            flush_threshold: 50,
            write_chunk_size: 10,
            shutdown_grace_ms: 30_000,
            validation_retries: 0,
            max_items: None,
        }
    }
}

impl EngineConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_max_items(mut self, max_items: u64) -> Self {
        self.max_items = Some(max_items);
        self
    }

    /// Check invariants that would otherwise stall or spin the engine.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1".to_string());
        }
        if self.max_concurrent == 0 {
            return Err("max_concurrent must be at least 1".to_string());
        }
        if self.max_retries == 0 {
            return Err("max_retries must be at least 1".to_string());
        }
        if self.throttle_multiplier <= 1.0 {
            return Err("throttle_multiplier must be greater than 1.0".to_string());
        }
        if self.max_spacing_ms < self.min_spacing_ms {
            return Err("max_spacing_ms must not be below min_spacing_ms".to_string());
        }
        Ok(())
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_concurrent: self.max_concurrent,
            min_spacing_ms: self.min_spacing_ms,
            max_spacing_ms: self.max_spacing_ms,
            throttle_multiplier: self.throttle_multiplier,
            quiet_period_ms: self.throttle_quiet_period_ms,
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_failure_threshold,
            recovery_timeout_ms: self.circuit_recovery_timeout_ms,
            trial_timeout_ms: self.request_timeout_ms,
        }
    }

    /// Per-attempt timeout, also used as the HTTP client timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            base_delay: self.retry_base_delay(),
            rate_limit_cap: Duration::from_millis(self.rate_limit_cap_ms),
            max_total_wait: Duration::from_millis(self.max_total_wait_ms),
            request_timeout: self.request_timeout(),
        }
    }
}
