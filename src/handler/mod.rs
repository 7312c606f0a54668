//! Per-connection replication handlers.
//!
//! - [`IncomingReplicationHandler`]: one per accepted inbound channel;
//!   applies batches from a peer through the conflict-aware write path.
//! - [`OutgoingReplicationHandler`]: one per enabled destination; ships
//!   local changes past the destination's acknowledged watermark.
//!
//! Both run as independent tasks, walk the [`HandlerState`] machine, emit
//! one [`PerformanceStatsSample`] per batch exchange and stop promptly when
//! the engine-wide shutdown signal fires.

mod incoming;
mod outgoing;
mod performance;
mod state;

pub use incoming::IncomingReplicationHandler;
pub use outgoing::OutgoingReplicationHandler;
pub use performance::{Direction, PerformanceRecorder, PerformanceStatsSample, SampleBuilder, StageTiming};
pub use state::{HandlerState, StateMachine};

use crate::config::{IncomingConfig, OutgoingConfig};
use crate::document::IncomingConnectionInfo;
use crate::registry::ConnectionRegistry;
use crate::resilience::RateLimiter;
use crate::storage::{ConflictsStorage, WatermarkStore};
use std::sync::Arc;
use tokio::sync::watch;

/// Dependencies shared by every handler of one database.
#[derive(Clone)]
pub struct HandlerContext {
    pub storage: Arc<ConflictsStorage>,
    pub registry: ConnectionRegistry,
    pub watermarks: WatermarkStore,
    /// This database as presented to peers in handshakes.
    pub identity: IncomingConnectionInfo,
    pub incoming: IncomingConfig,
    pub outgoing: OutgoingConfig,
    /// Charged once per applied item when set.
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub shutdown_rx: watch::Receiver<bool>,
}
