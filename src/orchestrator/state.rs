//! Orchestrator phases.
//!
//! ```text
//! Selecting -> Dispatching -> Collecting -> Flushing -> Selecting ...
//!     |                                        |
//!     +-------------> Draining -> Stopped <----+
//! ```
//! Draining is reachable from any running phase once shutdown is requested
//! or a fatal error occurs.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnginePhase {
    /// Querying the store for the next slice
    Selecting,
    /// Spawning item tasks
    Dispatching,
    /// Waiting for every item in the slice to finish
    Collecting,
    /// Writing buffered results and the checkpoint
    Flushing,
    /// Final write and checkpoint after the last slice
    Draining,
    Stopped,
}

impl EnginePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnginePhase::Selecting => "selecting",
            EnginePhase::Dispatching => "dispatching",
            EnginePhase::Collecting => "collecting",
            EnginePhase::Flushing => "flushing",
            EnginePhase::Draining => "draining",
            EnginePhase::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EnginePhase::Stopped)
    }

    /// Whether `next` may follow this phase.
    pub fn can_transition_to(&self, next: EnginePhase) -> bool {
        use EnginePhase::*;
        matches!(
            (self, next),
            (Selecting, Dispatching)
                | (Dispatching, Collecting)
                | (Collecting, Flushing)
                | (Flushing, Selecting)
                | (Selecting | Dispatching | Collecting | Flushing, Draining)
                | (Draining, Stopped)
        )
    }
}

impl std::fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
