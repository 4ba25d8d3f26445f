//! Resilience layer: rate limiting, circuit breaking and retries around the
//! external API.

pub mod circuit_breaker;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitSnapshot, CircuitState};
pub use rate_limit::{RateLimitConfig, RateLimiter, RatePermit};
pub use retry::{AttemptError, RetryPolicy, RetryingClient, SendError};
