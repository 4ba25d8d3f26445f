//! Request and reply types for the generative API.
//!
//! The engine treats [`RequestPayload`] as opaque beyond its timeout; the
//! wire envelope types here only exist to pull the text content out of the
//! two reply shapes the supported API families use.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A fully formed request body, built once per attempt by the collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestPayload {
    /// Model identifier
    pub model: String,

    /// Prompt input (string or structured messages)
    pub input: Value,

    /// Sampling and generation parameters
    #[serde(default)]
    pub parameters: Value,

    /// Per-request timeout override; never sent on the wire
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl RequestPayload {
    /// Create a payload with a text prompt and no parameters.
    pub fn new(model: impl Into<String>, input: impl Into<Value>) -> Self {
        Self {
            model: model.into(),
            input: input.into(),
            parameters: Value::Object(Default::default()),
            timeout: None,
        }
    }

    /// Attach generation parameters.
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Override the engine's request timeout for this payload.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The unparsed reply content of one successful external call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReply {
    /// Text content produced by the model
    pub content: String,

    /// HTTP status of the reply (200 for mocks)
    pub status: u16,
}

impl RawReply {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            status: 200,
        }
    }
}

/// Reply envelope covering both API families:
/// `{choices: [{message: {content}}]}` and `{message: {content}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplyEnvelope {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub message: Option<ReplyMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: ReplyMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl ReplyEnvelope {
    /// Extract the first text content, preferring `choices`.
    pub fn into_content(self) -> Option<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .or_else(|| self.message.and_then(|m| m.content))
    }
}
