//! # Document Replication
//!
//! Multi-master replication for a document database: every node accepts
//! writes, ships them to its destinations and applies what its peers send,
//! detecting concurrent edits with change vectors.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                            ReplicationEngine                              │
//! │                                                                           │
//! │  ┌──────────────────┐   batches   ┌────────────────────────────────────┐  │
//! │  │ Outgoing handler │◄────────────│ ConflictsStorage (SQLite)          │  │
//! │  │ (per destination)│             │ documents, conflicts, tombstones,  │  │
//! │  └──────────────────┘             │ watermarks                         │  │
//! │  ┌──────────────────┐   apply     │                                    │  │
//! │  │ Incoming handler │────────────►│                                    │  │
//! │  │ (per channel)    │             └────────────────────────────────────┘  │
//! │  └──────────────────┘                                                     │
//! │         │                                                                 │
//! │         ▼                                                                 │
//! │  ┌────────────────────┐   samples   ┌──────────────────────────────────┐  │
//! │  │ ConnectionRegistry │────────────►│ Live performance collectors      │  │
//! │  │ backoff, rejections│             │ (per monitoring session)         │  │
//! │  └────────────────────┘             └──────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Conflict Handling
//!
//! An incoming version whose change vector is concurrent with the local one
//! is stored alongside it as a conflict instead of overwriting. Operators
//! inspect conflicts through the monitoring views, ask the
//! [`ConflictResolverAdvisor`] for a merged suggestion and commit a
//! resolution with [`ReplicationEngine::resolve_conflict`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use doc_replication::{MemoryNetwork, ReplicationConfig, ReplicationEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let network = MemoryNetwork::new();
//!     let config = ReplicationConfig::for_testing("A", "orders");
//!
//!     let engine = ReplicationEngine::open(config, Arc::new(network.connector("A")))
//!         .await
//!         .expect("Failed to open");
//!     engine.start().await.expect("Failed to start");
//!
//!     // Engine runs until shutdown signal
//!     engine.shutdown().await;
//! }
//! ```

pub mod advisor;
pub mod change_vector;
pub mod collector;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod resilience;
pub mod storage;
pub mod transport;

pub use advisor::{ConflictResolverAdvisor, LatestWinsStrategy, MergeResult, MergeStrategy, ProvenanceArrayStrategy};
pub use change_vector::{Causality, ChangeVector};
pub use collector::{LiveReplicationPerformanceCollector, StatsHub};
pub use config::{ReplicationConfig, ReplicationSettings, StorageConfig};
pub use coordinator::{EngineState, ReplicationEngine};
pub use document::{
    ConflictVersion, IncomingConnectionInfo, Metadata, MetadataValue, ReplicatedDocument, ReplicationDestination,
    ReplicationItem, Tombstone,
};
pub use error::{ReplicationError, Result};
pub use handler::{Direction, HandlerState, IncomingReplicationHandler, OutgoingReplicationHandler, PerformanceStatsSample};
pub use registry::ConnectionRegistry;
pub use storage::{ApplyOutcome, ConflictsStorage};
pub use transport::{
    Connector, MemoryChannel, MemoryConnector, MemoryNetwork, ReplicationBatch, ReplicationChannel,
    ReplicationMessage, StreamChannel,
};
