//! HTTP implementation of [`ApiClient`]
//!
//! One `POST` per attempt with a JSON body `{model, input, parameters}` and
//! bearer-token authorization. Non-success statuses are classified into the
//! [`ApiError`] taxonomy; the reply envelope is reduced to its text content.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::{BatchforgeError, Result};
use crate::llm::client::{ApiClient, ApiError};
use crate::llm::types::{RawReply, ReplyEnvelope, RequestPayload};

/// Default request timeout when the payload carries none
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection establishment timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the HTTP client
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub endpoint: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl HttpClientConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Generative API client over HTTP
pub struct HttpApiClient {
    client: Client,
    config: HttpClientConfig,
}

impl HttpApiClient {
    /// Create a new client from explicit configuration
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(BatchforgeError::Config("API endpoint must not be empty".to_string()));
        }

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.timeout)
            .build()
            .map_err(|e| BatchforgeError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Create a client reading the API key from `env_var`
    pub fn from_env(endpoint: impl Into<String>, env_var: &str, timeout: Duration) -> Result<Self> {
        let api_key = std::env::var(env_var)
            .map_err(|_| BatchforgeError::Config(format!("{} not set", env_var)))?;
        Self::new(HttpClientConfig::new(endpoint, api_key).with_timeout(timeout))
    }
}

/// Parse a `Retry-After` header given in whole seconds
fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn send(&self, payload: &RequestPayload) -> std::result::Result<RawReply, ApiError> {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(payload);

        if let Some(timeout) = payload.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let hint = retry_after(response.headers());
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ApiError::from_status(status.as_u16(), message, hint));
        }

        let body = response.text().await?;
        let envelope: ReplyEnvelope = serde_json::from_str(&body)
            .map_err(|e| ApiError::InvalidResponse(format!("unparseable reply envelope: {}", e)))?;

        let content = envelope
            .into_content()
            .ok_or_else(|| ApiError::InvalidResponse("reply has no message content".to_string()))?;

        Ok(RawReply {
            content,
            status: status.as_u16(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{bearer_token, body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HttpApiClient {
        HttpApiClient::new(HttpClientConfig::new(format!("{}/v1/generate", server.uri()), "sk-test")).unwrap()
    }

    #[tokio::test]
    async fn test_send_success_choices_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/generate"))
            .and(bearer_token("sk-test"))
            .and(body_json(json!({"model": "m", "input": "hello", "parameters": {}})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"choices": [{"message": {"content": "{\"a\":1}"}}]})),
            )
            .mount(&server)
            .await;

        let reply = client_for(&server).send(&RequestPayload::new("m", "hello")).await.unwrap();
        assert_eq!(reply.content, "{\"a\":1}");
        assert_eq!(reply.status, 200);
    }

    #[tokio::test]
    async fn test_send_success_message_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message": {"content": "text"}})))
            .mount(&server)
            .await;

        let reply = client_for(&server).send(&RequestPayload::new("m", "x")).await.unwrap();
        assert_eq!(reply.content, "text");
    }

    #[tokio::test]
    async fn test_send_rate_limited_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = client_for(&server).send(&RequestPayload::new("m", "x")).await.unwrap_err();
        match err {
            ApiError::RateLimited { retry_after } => assert_eq!(retry_after, Some(Duration::from_secs(7))),
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = client_for(&server).send(&RequestPayload::new("m", "x")).await.unwrap_err();
        assert!(matches!(err, ApiError::Server { status: 503, ref message } if message == "overloaded"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_send_auth_failure_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
            .mount(&server)
            .await;

        let err = client_for(&server).send(&RequestPayload::new("m", "x")).await.unwrap_err();
        assert!(matches!(err, ApiError::Rejected { status: 401, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_send_envelope_without_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let err = client_for(&server).send(&RequestPayload::new("m", "x")).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_payload_timeout_maps_to_timeout_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(500))
                    .set_body_json(json!({"message": {"content": "late"}})),
            )
            .mount(&server)
            .await;

        let payload = RequestPayload::new("m", "x").with_timeout(Duration::from_millis(50));
        let err = client_for(&server).send(&payload).await.unwrap_err();
        assert!(matches!(err, ApiError::Timeout));
    }

    #[test]
    fn test_empty_endpoint_rejected() {
        let result = HttpApiClient::new(HttpClientConfig::new("  ", "key"));
        assert!(matches!(result, Err(BatchforgeError::Config(_))));
    }
}
