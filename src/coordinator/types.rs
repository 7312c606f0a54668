//! Engine state types.
//!
//! # State Transitions
//!
//! ```text
//!           start()               shutdown()            drained
//! Created ───────────▶ Running ───────────────▶ ShuttingDown ───────▶ Stopped
//!    │                                              ▲
//!    └──────────────────── shutdown() ──────────────┘
//! ```
//!
//! - **Created**: storage open, no handlers running, incoming refused.
//! - **Running**: outgoing handlers, reconnect sweep and watermark flush active.
//! - **ShuttingDown**: registrations refused, handlers draining.
//! - **Stopped**: watermarks flushed, storage closed. Safe to drop.

/// State of the replication engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Opened but not started.
    ///
    /// Call [`start()`](super::ReplicationEngine::start) to begin replication.
    Created,

    /// Replicating.
    Running,

    /// Shutting down; in-flight batches finish or are abandoned uncommitted.
    ShuttingDown,

    /// Shut down cleanly.
    Stopped,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineState::Created => "Created",
            EngineState::Running => "Running",
            EngineState::ShuttingDown => "ShuttingDown",
            EngineState::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
    }

    #[test]
    fn test_engine_state_equality() {
        assert_eq!(EngineState::Created, EngineState::Created);
        assert_ne!(EngineState::Created, EngineState::Running);
    }
}
