//! Core API client trait and the per-attempt error taxonomy

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::types::{RawReply, RequestPayload};

/// One external call per invocation; retries live in the resilience layer.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Send a single attempt and return the raw reply content.
    async fn send(&self, payload: &RequestPayload) -> Result<RawReply, ApiError>;
}

/// Errors that can occur during a single API attempt
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request rejected {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ApiError::RateLimited { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::RateLimited { .. } => true,
            ApiError::Server { .. } => true,
            ApiError::Timeout => true,
            ApiError::Connection(_) => true,
            ApiError::Rejected { .. } => false,
            ApiError::InvalidResponse(_) => false,
        }
    }

    /// Whether the failure says something about the dependency's health.
    /// Throttling is the rate limiter's concern and 4xx rejections are
    /// specific to one request.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            ApiError::Server { .. } | ApiError::Timeout | ApiError::Connection(_)
        )
    }

    /// Classify an HTTP status that is not a success.
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        match status {
            429 => ApiError::RateLimited { retry_after },
            408 => ApiError::Timeout,
            s if s >= 500 => ApiError::Server { status: s, message },
            s => ApiError::Rejected { status: s, message },
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::from_status(status.as_u16(), err.to_string(), None)
        } else {
            ApiError::Connection(err.to_string())
        }
    }
}

type Responder = Box<dyn Fn(&RequestPayload) -> Result<RawReply, ApiError> + Send + Sync>;

/// Scriptable client for tests and dry runs.
///
/// Calls are keyed by the payload's `input` rendered as a string. Queued
/// errors for a key are returned first, then the responder is used.
pub struct MockApiClient {
    responder: Responder,
    scripted: Mutex<HashMap<String, VecDeque<ApiError>>>,
    calls: AtomicU64,
    delay: Option<Duration>,
}

impl MockApiClient {
    /// A client whose every call is answered by `responder`.
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&RequestPayload) -> Result<RawReply, ApiError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            scripted: Mutex::new(HashMap::new()),
            calls: AtomicU64::new(0),
            delay: None,
        }
    }

    /// A client that always replies with the same content.
    pub fn replying(content: impl Into<String>) -> Self {
        let content = content.into();
        Self::new(move |_| Ok(RawReply::new(content.clone())))
    }

    /// Simulate latency on every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `times` calls whose input key equals `key`.
    pub fn fail_first(&self, key: impl Into<String>, times: usize, error: ApiError) {
        let mut scripted = self.scripted.lock().unwrap_or_else(|p| p.into_inner());
        let queue = scripted.entry(key.into()).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Total calls received.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// The key a payload is scripted under.
    pub fn key_for(payload: &RequestPayload) -> String {
        match &payload.input {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
impl ApiClient for MockApiClient {
    async fn send(&self, payload: &RequestPayload) -> Result<RawReply, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = {
            let mut scripted = self.scripted.lock().unwrap_or_else(|p| p.into_inner());
            scripted
                .get_mut(&Self::key_for(payload))
                .and_then(|queue| queue.pop_front())
        };

        match scripted {
            Some(err) => Err(err),
            None => (self.responder)(payload),
        }
    }
}
