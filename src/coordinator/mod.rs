// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The orchestrator for one database that ties together:
//! - Conflict-aware persistence via [`ConflictsStorage`]
//! - Connection bookkeeping via [`ConnectionRegistry`]
//! - One [`OutgoingReplicationHandler`] per enabled destination
//! - One [`IncomingReplicationHandler`] per accepted channel
//! - Live performance collection for monitoring sessions
//!
//! # Architecture
//!
//! 1. Opens storage and loads persisted watermarks
//! 2. Spawns an outgoing handler per destination
//! 3. Re-spawns failed destinations from the reconnect queue once their backoff elapses
//! 4. Flushes dirty watermarks on a debounce interval
//! 5. Handles graceful shutdown, draining every handler task

mod types;

pub use types::EngineState;

use crate::advisor::ConflictResolverAdvisor;
use crate::collector::{LiveReplicationPerformanceCollector, StatsHub};
use crate::config::ReplicationConfig;
use crate::document::{IncomingConnectionInfo, Metadata, ReplicatedDocument, ReplicationDestination};
use crate::error::{ReplicationError, Result};
use crate::handler::{HandlerContext, IncomingReplicationHandler, OutgoingReplicationHandler};
use crate::metrics;
use crate::monitor::{
    self, ActiveConnections, ConflictResolutionSuggestion, ConflictsPage, DocumentConflicts,
    IncomingActivityStats, IncomingRejectionStats, LiveSessionSummary, LiveSink, OutgoingFailureStats,
    PerformanceSnapshot, ReconnectQueueInfo, TombstonesPage,
};
use crate::registry::ConnectionRegistry;
use crate::resilience::RateLimiter;
use crate::storage::{ConflictsStorage, WatermarkStore};
use crate::transport::{Connector, ReplicationChannel};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

type TaskList = Arc<Mutex<Vec<JoinHandle<()>>>>;

/// The replication subsystem of one database.
///
/// # Example
///
/// ```rust,no_run
/// use doc_replication::{MemoryNetwork, ReplicationConfig, ReplicationEngine};
/// use std::sync::Arc;
///
/// # async fn example() -> doc_replication::Result<()> {
/// let network = MemoryNetwork::new();
/// let config = ReplicationConfig::for_testing("A", "orders");
/// let engine = ReplicationEngine::open(config, Arc::new(network.connector("A"))).await?;
/// engine.start().await?;
///
/// engine.storage().put_document("users/1", "Users", serde_json::json!({"name": "Ann"}), Default::default()).await?;
///
/// engine.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct ReplicationEngine {
    config: ReplicationConfig,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    storage: Arc<ConflictsStorage>,
    watermarks: WatermarkStore,
    registry: ConnectionRegistry,
    hub: StatsHub,
    connector: Arc<dyn Connector>,
    identity: IncomingConnectionInfo,

    /// Shared across every incoming handler.
    rate_limiter: Option<Arc<RateLimiter>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Handler, sweep and flush task handles
    tasks: TaskList,
}

impl ReplicationEngine {
    /// Open storage and build the engine in the `Created` state.
    ///
    /// Call [`start()`](Self::start) to begin replicating.
    pub async fn open(config: ReplicationConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;

        let storage = ConflictsStorage::open(&config.storage, config.node_tag.clone()).await?;
        let watermarks = storage.watermarks().await?;

        let hub = StatsHub::new();
        let registry = ConnectionRegistry::new(
            &config.settings.registry,
            hub.clone(),
            config.settings.performance.ring_capacity,
        );

        let rate_limiter = config.settings.incoming.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for incoming batches"
            );
            Arc::new(RateLimiter::new(cfg))
        });

        let identity = IncomingConnectionInfo {
            source_database_id: config.database_id.clone(),
            source_database_name: config.database_name.clone(),
            source_machine_name: config.machine_name.clone(),
            source_url: config.url.clone(),
        };

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        metrics::set_engine_state(EngineState::Created.as_str());

        info!(
            node_tag = %config.node_tag,
            database = %config.database_name,
            path = %storage.path(),
            "Replication engine opened"
        );

        Ok(Self {
            config,
            state_tx,
            state_rx,
            storage: Arc::new(storage),
            watermarks,
            registry,
            hub,
            connector,
            identity,
            rate_limiter,
            shutdown_tx,
            shutdown_rx,
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn node_tag(&self) -> &str {
        &self.config.node_tag
    }

    pub fn storage(&self) -> &Arc<ConflictsStorage> {
        &self.storage
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn watermarks(&self) -> &WatermarkStore {
        &self.watermarks
    }

    fn handler_context(&self) -> HandlerContext {
        HandlerContext {
            storage: Arc::clone(&self.storage),
            registry: self.registry.clone(),
            watermarks: self.watermarks.clone(),
            identity: self.identity.clone(),
            incoming: self.config.settings.incoming.clone(),
            outgoing: self.config.settings.outgoing.clone(),
            rate_limiter: self.rate_limiter.clone(),
            shutdown_rx: self.shutdown_rx.clone(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start replicating.
    ///
    /// 1. Spawns an outgoing handler for each configured destination
    /// 2. Spawns the reconnect sweep
    /// 3. Spawns the watermark flush task
    pub async fn start(&self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: EngineState::Created.to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            node_tag = %self.config.node_tag,
            destinations = self.config.destinations.len(),
            "Starting replication engine"
        );

        let ctx = self.handler_context();
        {
            let mut tasks = self.tasks.lock().await;
            for destination in &self.config.destinations {
                tasks.push(spawn_outgoing(ctx.clone(), Arc::clone(&self.connector), destination.clone()));
            }
        }

        self.spawn_reconnect_sweep(ctx).await;
        self.spawn_watermark_flush_task().await;

        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_engine_state(EngineState::Running.as_str());
        info!("Replication engine running");
        Ok(())
    }

    /// Hand an accepted channel to a new incoming handler.
    ///
    /// The handshake and every batch run on a spawned task; this returns
    /// as soon as the task is scheduled.
    pub async fn accept_incoming(&self, channel: Box<dyn ReplicationChannel>) -> Result<()> {
        let state = self.state();
        if state != EngineState::Running {
            return Err(match state {
                EngineState::ShuttingDown | EngineState::Stopped => ReplicationError::ShuttingDown,
                _ => ReplicationError::InvalidState {
                    expected: EngineState::Running.to_string(),
                    actual: state.to_string(),
                },
            });
        }

        let peer = channel.peer().to_string();
        let handler = IncomingReplicationHandler::new(self.handler_context(), channel);
        let handle = tokio::spawn(async move {
            if let Err(e) = handler.run().await {
                debug!(peer = %peer, error = %e, "Incoming handler ended with error");
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
        Ok(())
    }

    /// Re-spawn destinations whose backoff elapsed.
    async fn spawn_reconnect_sweep(&self, ctx: HandlerContext) {
        let registry = self.registry.clone();
        let connector = Arc::clone(&self.connector);
        let tasks = Arc::clone(&self.tasks);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let sweep_interval = self.config.settings.reconnect.sweep_interval_duration();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(sweep_interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Reconnect sweep stopping");
                            break;
                        }
                    }
                    _ = timer.tick() => {
                        let due: Vec<ReplicationDestination> = registry.drain_due_reconnects(Utc::now()).collect();
                        if due.is_empty() {
                            continue;
                        }
                        metrics::record_reconnects(due.len());
                        let mut guard = tasks.lock().await;
                        guard.retain(|t| !t.is_finished());
                        for destination in due {
                            info!(destination = %destination, "Reconnecting to destination");
                            guard.push(spawn_outgoing(ctx.clone(), Arc::clone(&connector), destination));
                        }
                    }
                }
            }
        });

        debug!(interval = ?sweep_interval, "Spawned reconnect sweep");
        self.tasks.lock().await.push(handle);
    }

    /// Spawn the watermark flush task for debounced writes.
    async fn spawn_watermark_flush_task(&self) {
        let watermarks = self.watermarks.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let flush_interval = self.config.storage.watermark_flush_interval_duration();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(flush_interval);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = watermarks.flush_dirty().await {
                            warn!(error = %e, "Failed to flush watermarks");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Watermark flush task stopping");
                            break;
                        }
                    }
                }
            }
        });

        debug!("Spawned watermark flush task");
        self.tasks.lock().await.push(handle);
    }

    /// Shut down gracefully.
    ///
    /// 1. Refuses new registrations
    /// 2. Signals every handler and background task to stop
    /// 3. Waits for tasks to finish (with timeout)
    /// 4. Flushes watermarks and closes storage
    ///
    /// Calling it again after the engine stopped is a no-op.
    pub async fn shutdown(&self) {
        if matches!(self.state(), EngineState::ShuttingDown | EngineState::Stopped) {
            return;
        }

        info!("Shutting down replication engine");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state(EngineState::ShuttingDown.as_str());

        self.registry.begin_shutdown();
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.tasks.lock().await;
            std::mem::take(&mut *guard)
        };

        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to drain and complete");
        }

        // One deadline for the whole drain; stragglers are aborted.
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        match tokio::time::timeout(DRAIN_TIMEOUT, futures::future::join_all(handles)).await {
            Ok(results) => {
                for (i, result) in results.into_iter().enumerate() {
                    match result {
                        Ok(()) => debug!(task = i + 1, "Task completed gracefully"),
                        Err(e) if e.is_cancelled() => debug!(task = i + 1, "Task cancelled"),
                        Err(e) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                    }
                }
            }
            Err(_) => {
                let stragglers = aborts.iter().filter(|a| !a.is_finished()).count();
                warn!(
                    stragglers,
                    timeout = ?DRAIN_TIMEOUT,
                    "Drain deadline passed, aborting tasks (batches abandoned uncommitted)"
                );
                for abort in &aborts {
                    abort.abort();
                }
            }
        }

        match self.watermarks.flush_dirty().await {
            Ok(flushed) => debug!(flushed, "Final watermark flush"),
            Err(e) => warn!(error = %e, "Final watermark flush failed"),
        }
        self.storage.close().await;

        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state(EngineState::Stopped.as_str());
        info!("Replication engine stopped");
    }

    // =========================================================================
    // Monitoring views
    // =========================================================================

    /// Tombstones in etag order starting at position `start`.
    pub async fn tombstones(&self, start: u32, page_size: u32) -> Result<TombstonesPage> {
        let results = self.storage.tombstones_page(start, page_size).await?;
        Ok(TombstonesPage { results })
    }

    /// Conflicted documents whose newest competing version is past `since`.
    pub async fn conflicts(&self, since: u64, start: u32, page_size: u32) -> Result<ConflictsPage> {
        self.storage.conflicts_page(since, start, page_size).await
    }

    /// Every competing version of `id`. Empty `results` when not conflicted.
    pub async fn document_conflicts(&self, id: &str) -> Result<DocumentConflicts> {
        let versions = self.storage.get_conflicts_for(id).await?;
        Ok(DocumentConflicts::from_versions(id, &versions))
    }

    pub async fn performance(&self) -> PerformanceSnapshot {
        PerformanceSnapshot::collect(&self.registry).await
    }

    pub fn active_connections(&self) -> ActiveConnections {
        ActiveConnections::collect(&self.registry)
    }

    pub fn outgoing_failure_stats(&self) -> OutgoingFailureStats {
        monitor::outgoing_failures(&self.registry)
    }

    pub fn incoming_activity_stats(&self) -> IncomingActivityStats {
        monitor::incoming_last_activity(&self.registry)
    }

    pub fn incoming_rejection_stats(&self) -> IncomingRejectionStats {
        monitor::incoming_rejections(&self.registry)
    }

    pub fn reconnect_queue_info(&self) -> ReconnectQueueInfo {
        ReconnectQueueInfo::collect(&self.registry)
    }

    /// Subscribe a new live collector to every handler's samples.
    ///
    /// Call [`dispose`](LiveReplicationPerformanceCollector::dispose) when done.
    pub async fn live_collector(&self) -> LiveReplicationPerformanceCollector {
        LiveReplicationPerformanceCollector::new(
            self.hub.clone(),
            self.shutdown_rx.clone(),
            self.config.settings.performance.live_queue_capacity,
        )
        .await
    }

    /// Stream live samples and heartbeats into `sink` until it closes or the
    /// engine shuts down.
    pub async fn run_live_session<S: LiveSink>(&self, sink: &mut S) -> LiveSessionSummary {
        let collector = self.live_collector().await;
        let performance = &self.config.settings.performance;
        monitor::run_live_session(
            collector,
            sink,
            performance.live_first_wait_duration(),
            performance.live_heartbeat_wait_duration(),
            self.shutdown_rx.clone(),
        )
        .await
    }

    // =========================================================================
    // Conflict resolution
    // =========================================================================

    /// Merge the competing versions of `id` into a suggested document.
    pub async fn suggest_resolution(&self, id: &str) -> Result<ConflictResolutionSuggestion> {
        let versions = self.storage.get_conflicts_for(id).await?;
        if versions.is_empty() {
            return Err(ReplicationError::NotConflicted(id.to_string()));
        }
        let merged = ConflictResolverAdvisor::new(&versions).resolve();
        debug!(
            id,
            versions = versions.len(),
            divergent = merged.divergent_fields.len(),
            "Suggested conflict resolution"
        );
        Ok(ConflictResolutionSuggestion {
            document: merged.document,
            metadata: merged.metadata,
        })
    }

    /// Store `body` as the resolution of every competing version of `id`.
    pub async fn resolve_conflict(
        &self,
        id: &str,
        body: serde_json::Value,
        metadata: Metadata,
    ) -> Result<ReplicatedDocument> {
        self.storage.resolve_conflict(id, body, metadata).await
    }
}

fn spawn_outgoing(
    ctx: HandlerContext,
    connector: Arc<dyn Connector>,
    destination: ReplicationDestination,
) -> JoinHandle<()> {
    let handler = OutgoingReplicationHandler::new(ctx, connector, destination);
    tokio::spawn(async move {
        if let Err(e) = handler.run().await {
            debug!(error = %e, "Outgoing handler ended with error");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::MetadataValue;
    use crate::transport::{MemoryChannel, MemoryNetwork, ReplicationMessage};
    use serde_json::json;

    async fn engine(tag: &str) -> (ReplicationEngine, MemoryNetwork) {
        let network = MemoryNetwork::new();
        let config = ReplicationConfig::for_testing(tag, "orders");
        let engine = ReplicationEngine::open(config, Arc::new(network.connector(tag)))
            .await
            .unwrap();
        (engine, network)
    }

    #[tokio::test]
    async fn test_engine_initial_state() {
        let (engine, _network) = engine("A").await;
        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_running());
        assert_eq!(engine.node_tag(), "A");
        assert_eq!(*engine.state_receiver().borrow(), EngineState::Created);
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let network = MemoryNetwork::new();
        let mut config = ReplicationConfig::for_testing("A", "orders");
        config.node_tag = "A:1".to_string();
        let result = ReplicationEngine::open(config, Arc::new(network.connector("A"))).await;
        assert!(matches!(result, Err(ReplicationError::Config(_))));
    }

    #[tokio::test]
    async fn test_open_rejects_zero_intervals() {
        let network = MemoryNetwork::new();

        let mut config = ReplicationConfig::for_testing("A", "orders");
        config.settings.reconnect.sweep_interval = "0s".to_string();
        let result = ReplicationEngine::open(config, Arc::new(network.connector("A"))).await;
        assert!(matches!(result, Err(ReplicationError::Config(_))));

        let mut config = ReplicationConfig::for_testing("A", "orders");
        config.storage.watermark_flush_interval = "0ms".to_string();
        let result = ReplicationEngine::open(config, Arc::new(network.connector("A"))).await;
        assert!(matches!(result, Err(ReplicationError::Config(_))));

        let mut config = ReplicationConfig::for_testing("A", "orders");
        config.settings.outgoing.heartbeat_interval = "0s".to_string();
        let result = ReplicationEngine::open(config, Arc::new(network.connector("A"))).await;
        assert!(matches!(result, Err(ReplicationError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid_state() {
        let (engine, _network) = engine("A").await;
        engine.start().await.unwrap();
        assert!(engine.is_running());

        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidState { .. }));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_reaches_stopped_and_is_idempotent() {
        let (engine, _network) = engine("A").await;
        engine.start().await.unwrap();
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.registry().is_shutting_down());

        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_accept_incoming_before_start_is_refused() {
        let (engine, _network) = engine("A").await;
        let (_client, server) = MemoryChannel::pair("b", "a", 4);
        let err = engine.accept_incoming(Box::new(server)).await.unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_accept_incoming_after_shutdown_is_refused() {
        let (engine, _network) = engine("A").await;
        engine.start().await.unwrap();
        engine.shutdown().await;

        let (_client, server) = MemoryChannel::pair("b", "a", 4);
        let err = engine.accept_incoming(Box::new(server)).await.unwrap_err();
        assert!(matches!(err, ReplicationError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_accept_incoming_runs_handshake() {
        let (engine, _network) = engine("A").await;
        engine.start().await.unwrap();

        let (mut client, server) = MemoryChannel::pair("b", "a", 4);
        engine.accept_incoming(Box::new(server)).await.unwrap();

        client
            .send(ReplicationMessage::Handshake {
                source: crate::handler::test_support::identity("orders-b", "orders"),
                target_database: "orders".to_string(),
            })
            .await
            .unwrap();
        let reply = client.receive().await.unwrap();
        assert!(matches!(
            reply,
            Some(ReplicationMessage::HandshakeAck { accepted: true, last_accepted_etag: 0, .. })
        ));

        tokio::time::timeout(Duration::from_secs(2), async {
            while engine.active_connections().incoming_connections.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        engine.shutdown().await;
        assert!(engine.active_connections().incoming_connections.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_destination_enters_reconnect_queue() {
        let network = MemoryNetwork::new();
        let mut config = ReplicationConfig::for_testing("A", "orders");
        config.destinations = vec![ReplicationDestination::new("http://b.test:8080", "orders")];
        let engine = ReplicationEngine::open(config, Arc::new(network.connector("A")))
            .await
            .unwrap();
        engine.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while engine.outgoing_failure_stats().stats.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let failures = engine.outgoing_failure_stats();
        assert!(failures.stats[0].value.error_count >= 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_suggest_resolution_requires_conflict() {
        let (engine, _network) = engine("A").await;
        engine
            .storage()
            .put_document("users/1", "Users", json!({"name": "Ann"}), Metadata::new())
            .await
            .unwrap();

        let err = engine.suggest_resolution("users/1").await.unwrap_err();
        assert!(matches!(err, ReplicationError::NotConflicted(id) if id == "users/1"));
    }

    #[tokio::test]
    async fn test_document_conflicts_empty_for_plain_document() {
        let (engine, _network) = engine("A").await;
        let view = engine.document_conflicts("users/404").await.unwrap();
        assert!(view.results.is_empty());
    }

    #[tokio::test]
    async fn test_tombstones_view_pages_deletions() {
        let (engine, _network) = engine("A").await;
        for i in 0..3 {
            let id = format!("users/{i}");
            let mut metadata = Metadata::new();
            metadata.insert("Raven-Entity-Name".to_string(), MetadataValue::from("Users"));
            engine.storage().put_document(&id, "Users", json!({"n": i}), metadata).await.unwrap();
            engine.storage().delete_document(&id).await.unwrap();
        }

        let first = engine.tombstones(0, 2).await.unwrap();
        assert_eq!(first.results.len(), 2);
        let rest = engine.tombstones(2, 2).await.unwrap();
        assert_eq!(rest.results.len(), 1);
        assert_eq!(rest.results[0].id, "users/2");
    }

    #[tokio::test]
    async fn test_live_collector_times_out_without_samples() {
        let (engine, _network) = engine("A").await;
        let collector = engine.live_collector().await;
        let (has_data, samples) = collector.try_dequeue(Duration::from_millis(10)).await;
        assert!(!has_data);
        assert!(samples.is_empty());
        collector.dispose().await;
    }
}
