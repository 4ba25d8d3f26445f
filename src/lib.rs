//! Batchforge - a resilient batch engine for generative API backlogs
//!
//! Batchforge pulls unprocessed documents from a store, asks a generative API
//! to produce content for each, validates the reply, and writes results back
//! in bulk. Calls share one concurrency and spacing budget, back off on
//! throttling, stop at a circuit breaker when the API is failing, and a
//! checkpoint lets an interrupted run resume without redoing finished work.

pub mod checkpoint;
pub mod domain;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod orchestrator;
pub mod resilience;
pub mod shutdown;
pub mod storage;
pub mod template;

pub use error::{BatchforgeError, Result};
