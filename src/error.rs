//! Error types for Batchforge
//!
//! Centralized error handling using thiserror. Per-attempt and per-item
//! errors live next to the components that raise them; this enum covers
//! failures that can stop a run or a storage call.

use thiserror::Error;

/// All crate-level error types that can occur in Batchforge
#[derive(Debug, Error)]
pub enum BatchforgeError {
    /// Backing store unreachable or a store operation failed as a whole
    #[error("Storage error: {0}")]
    Storage(String),

    /// Checkpoint snapshot could not be read or written
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Invalid engine or content-type configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type alias for Batchforge operations
pub type Result<T> = std::result::Result<T, BatchforgeError>;
