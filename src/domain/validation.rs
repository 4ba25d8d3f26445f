//! Collaborator interfaces and the validation error taxonomy.
//!
//! The engine knows nothing about prompts or reply schemas. A collaborator
//! turns a [`WorkItem`] into a [`RequestPayload`] and a [`RawReply`] back into
//! an [`ItemResult`]. Collaborators must:
//! - only ever produce results for the originating item
//! - check structural counts and either correct them deterministically or
//!   reject them
//! - be deterministic for the same input

use serde_json::{Map, Value};

use super::work_item::{ItemResult, WorkItem};
use crate::llm::{RawReply, RequestPayload};

/// Why a reply could not be turned into a result
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing field: {field}")]
    MissingField { field: String },

    #[error("Count mismatch for {field}: expected {expected}, got {actual}")]
    CountMismatch { field: String, expected: usize, actual: usize },

    #[error("Value out of range for {field}: {detail}")]
    OutOfRange { field: String, detail: String },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Result for {actual} returned while processing {expected}")]
    ForeignResult { expected: String, actual: String },
}

impl ValidationError {
    pub fn missing(field: impl Into<String>) -> Self {
        ValidationError::MissingField { field: field.into() }
    }

    /// Short tag for logs and summaries
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::MissingField { .. } => "missing_field",
            ValidationError::CountMismatch { .. } => "count_mismatch",
            ValidationError::OutOfRange { .. } => "out_of_range",
            ValidationError::MalformedPayload(_) => "malformed_payload",
            ValidationError::ForeignResult { .. } => "foreign_result",
        }
    }
}

/// Builds the request for one item. Called once per logical call.
pub trait RequestBuilder: Send + Sync {
    fn build_request(&self, item: &WorkItem) -> Result<RequestPayload, ValidationError>;
}

/// Validates a raw reply and reshapes it into an update.
pub trait ResponseValidator: Send + Sync {
    fn validate(&self, reply: &RawReply, item: &WorkItem) -> Result<ItemResult, ValidationError>;
}

/// Both halves of a content type.
pub trait Collaborator: RequestBuilder + ResponseValidator {}

impl<T: RequestBuilder + ResponseValidator> Collaborator for T {}

type BuildFn = Box<dyn Fn(&WorkItem) -> Result<RequestPayload, ValidationError> + Send + Sync>;
type ValidateFn = Box<dyn Fn(&RawReply, &WorkItem) -> Result<ItemResult, ValidationError> + Send + Sync>;

/// Collaborator assembled from two closures.
pub struct FnCollaborator {
    build: BuildFn,
    validate: ValidateFn,
}

impl FnCollaborator {
    pub fn new<B, V>(build: B, validate: V) -> Self
    where
        B: Fn(&WorkItem) -> Result<RequestPayload, ValidationError> + Send + Sync + 'static,
        V: Fn(&RawReply, &WorkItem) -> Result<ItemResult, ValidationError> + Send + Sync + 'static,
    {
        Self {
            build: Box::new(build),
            validate: Box::new(validate),
        }
    }
}

impl RequestBuilder for FnCollaborator {
    fn build_request(&self, item: &WorkItem) -> Result<RequestPayload, ValidationError> {
        (self.build)(item)
    }
}

impl ResponseValidator for FnCollaborator {
    fn validate(&self, reply: &RawReply, item: &WorkItem) -> Result<ItemResult, ValidationError> {
        (self.validate)(reply, item)
    }
}

/// Parse model output as a JSON object.
///
/// Accepts the bare object or the object wrapped in exactly one fenced code
/// block. Nothing is extracted from surrounding prose.
pub fn parse_reply_json(content: &str) -> Result<Map<String, Value>, ValidationError> {
    let body = unfence(content.trim())?;

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ValidationError::MalformedPayload(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
        Err(e) => Err(ValidationError::MalformedPayload(format!("invalid JSON: {}", e))),
    }
}

fn unfence(text: &str) -> Result<&str, ValidationError> {
    const FENCE: &str = "```";

    if !text.starts_with(FENCE) {
        return Ok(text);
    }

    // Opening fence line may carry a language tag
    let after_open = match text.find('\n') {
        Some(idx) => &text[idx + 1..],
        None => return Err(ValidationError::MalformedPayload("unterminated code fence".to_string())),
    };
    let inner = after_open
        .strip_suffix(FENCE)
        .ok_or_else(|| ValidationError::MalformedPayload("text after closing code fence".to_string()))?;
    if inner.contains(FENCE) {
        return Err(ValidationError::MalformedPayload("more than one code block".to_string()));
    }
    Ok(inner.trim())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
