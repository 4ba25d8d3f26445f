//! Domain types for the engine
//!
//! - WorkItem / ItemResult: what goes in and what comes out
//! - Collaborator traits (RequestBuilder, ResponseValidator) and ValidationError
//! - ItemOutcome: terminal result of one item

pub mod outcome;
pub mod validation;
pub mod work_item;

pub use outcome::{FailureReason, ItemOutcome};
pub use validation::{
    Collaborator, FnCollaborator, RequestBuilder, ResponseValidator, ValidationError, parse_reply_json,
};
pub use work_item::{ItemResult, WorkItem};
