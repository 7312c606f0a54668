//! Connection state machine shared by both handler directions.
//!
//! ```text
//! Connecting ─▶ Handshaking ─▶ Streaming/Sending ⇄ Idle ─▶ Closing ─▶ Closed
//!      │             │                │              │          │
//!      └─────────────┴────────────────┴──────────────┴──────────┴──▶ Faulted
//! ```
//!
//! Incoming handlers use `Streaming`, outgoing handlers use `Sending`.
//! `Closed` and `Faulted` are terminal.

use crate::error::{ReplicationError, Result};
use crate::handler::Direction;
use crate::metrics;
use std::fmt;
use tokio::sync::watch;
use tracing::trace;

/// Lifecycle state of one replication connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerState {
    Connecting,
    Handshaking,
    /// Incoming: applying a received batch.
    Streaming,
    /// Outgoing: a batch is on the wire.
    Sending,
    /// Waiting for the next batch or for new local changes.
    Idle,
    Closing,
    Closed,
    Faulted,
}

impl HandlerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HandlerState::Closed | HandlerState::Faulted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HandlerState::Connecting => "connecting",
            HandlerState::Handshaking => "handshaking",
            HandlerState::Streaming => "streaming",
            HandlerState::Sending => "sending",
            HandlerState::Idle => "idle",
            HandlerState::Closing => "closing",
            HandlerState::Closed => "closed",
            HandlerState::Faulted => "faulted",
        }
    }

    /// Whether `self -> next` is a legal edge.
    pub fn can_transition_to(self, next: HandlerState) -> bool {
        use HandlerState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Faulted) => true,
            (Connecting, Handshaking) => true,
            (Handshaking, Streaming | Sending | Idle) => true,
            (Streaming | Sending, Idle) => true,
            (Idle, Streaming | Sending) => true,
            (Connecting | Handshaking | Streaming | Sending | Idle, Closing) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state of one handler, observable through a watch channel.
pub struct StateMachine {
    direction: Direction,
    tx: watch::Sender<HandlerState>,
}

impl StateMachine {
    pub fn new(direction: Direction) -> Self {
        let (tx, _) = watch::channel(HandlerState::Connecting);
        metrics::record_handler_state(direction.as_str(), HandlerState::Connecting.as_str());
        Self { direction, tx }
    }

    pub fn current(&self) -> HandlerState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<HandlerState> {
        self.tx.subscribe()
    }

    /// Move to `next`, refusing illegal edges.
    pub fn transition(&self, next: HandlerState) -> Result<()> {
        let current = self.current();
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(ReplicationError::InvalidState {
                expected: format!("a state that may move to {}", next),
                actual: current.to_string(),
            });
        }
        self.tx.send_replace(next);
        trace!(direction = %self.direction, from = %current, to = %next, "Handler state change");
        metrics::record_handler_state(self.direction.as_str(), next.as_str());
        Ok(())
    }

    /// Enter `Faulted` unless already terminal.
    pub fn fault(&self) {
        if !self.current().is_terminal() {
            let _ = self.transition(HandlerState::Faulted);
        }
    }

    /// Walk through `Closing` to `Closed` unless already terminal.
    pub fn close(&self) {
        if self.current().is_terminal() {
            return;
        }
        let _ = self.transition(HandlerState::Closing);
        let _ = self.transition(HandlerState::Closed);
    }
}
