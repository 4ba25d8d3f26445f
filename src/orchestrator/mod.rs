//! Orchestrator: selection, fan-out, collection and flushing of the backlog.

pub mod config;
pub mod engine;
pub mod state;

pub use config::EngineConfig;
pub use engine::Orchestrator;
pub use state::EnginePhase;
