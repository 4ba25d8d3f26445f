//! API Client Layer - generative API integration
//!
//! This module provides:
//! - Request/reply types and the reply envelope parser
//! - ApiClient trait for API abstraction and the per-attempt error taxonomy
//! - HttpApiClient implementation
//! - MockApiClient for tests and dry runs

pub mod client;
pub mod http;
pub mod types;

pub use client::{ApiClient, ApiError, MockApiClient};
pub use http::{HttpApiClient, HttpClientConfig};
pub use types::{RawReply, ReplyEnvelope, RequestPayload};
