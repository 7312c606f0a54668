// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for document replication.
//!
//! Errors are categorized by who has to act on them: the reconnect machinery
//! (transient transport and storage trouble), the peer (protocol violations,
//! rejections) or the operator (configuration, invariant violations).
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `ShuttingDown` | No | Registry/engine is tearing down |
//! | `ProtocolViolation` | No | Malformed frame or batch from a peer |
//! | `Storage` | Busy only | SQLite write/read failure, batch rolled back |
//! | `Serialization` | No | Stored or received JSON could not be decoded |
//! | `Rejected` | Yes | Incoming connection refused, peer backs off |
//! | `AckTimeout` | Yes | Outgoing batch not acknowledged in time |
//! | `Transport` | Yes | Connection dropped or could not be established |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Lifecycle state machine violation |
//! | `NotConflicted` | No | Resolution requested for a document without conflicts |
//! | `Internal` | No | Unexpected internal error |
//!
//! Replaying an already-applied write is not an error: it resolves to
//! [`ApplyOutcome::Superseded`](crate::storage::ApplyOutcome::Superseded).

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The registry or engine is shutting down; new work is refused.
    #[error("Shutdown in progress")]
    ShuttingDown,

    /// A peer sent something that does not follow the replication protocol.
    ///
    /// The owning connection faults. Not retried automatically.
    #[error("Protocol violation from {peer}: {message}")]
    ProtocolViolation { peer: String, message: String },

    /// Underlying SQLite operation failed.
    ///
    /// Batch application is transactional, so nothing was partially applied.
    /// The connection faults and the batch is re-sent after reconnect.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// JSON encode/decode failure for bodies, metadata or frames.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Incoming connection refused; the reason is recorded in rejection history.
    #[error("Connection from {source_id} rejected: {reason}")]
    Rejected { source_id: String, reason: String },

    /// Outgoing batch was not acknowledged within the timeout.
    #[error("Acknowledgment from {destination} timed out after {timeout_ms}ms")]
    AckTimeout { destination: String, timeout_ms: u64 },

    /// Transport failure (connect refused, stream closed, I/O error).
    #[error("Transport error ({peer}): {message}")]
    Transport { peer: String, message: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong lifecycle state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Resolution requested for a document that has no stored conflict.
    #[error("Document {0} is not in conflict")]
    NotConflicted(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a protocol violation error.
    pub fn protocol(peer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            peer: peer.into(),
            message: message.into(),
        }
    }

    /// Create a transport error.
    pub fn transport(peer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            peer: peer.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::AckTimeout { .. } => true,
            Self::Rejected { .. } => true, // Peer retries out-of-band
            Self::Storage(e) => is_busy(e),
            Self::ShuttingDown => false,
            Self::ProtocolViolation { .. } => false,
            Self::Serialization(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::NotConflicted(_) => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label used for metrics and failure bookkeeping.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ShuttingDown => "shutting_down",
            Self::ProtocolViolation { .. } => "protocol_violation",
            Self::Storage(_) => "storage",
            Self::Serialization(_) => "serialization",
            Self::Rejected { .. } => "rejected",
            Self::AckTimeout { .. } => "ack_timeout",
            Self::Transport { .. } => "transport",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::NotConflicted(_) => "not_conflicted",
            Self::Internal(_) => "internal",
        }
    }
}

/// SQLITE_BUSY = 5, SQLITE_LOCKED = 6
pub(crate) fn is_busy(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}
