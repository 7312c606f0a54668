// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection registry.
//!
//! One [`ConnectionRegistry`] per open database tracks:
//!
//! - live incoming connections (and, per source, the one allowed to stream)
//! - live outgoing connections, at most one per destination
//! - per-destination failure counts and backoff
//! - the reconnect queue of destinations waiting out their backoff
//! - per-source rejection history and last activity
//!
//! Each of these is its own concurrent map, sharded by key. No operation
//! takes a lock spanning more than one peer, so a destination that keeps
//! failing never stalls registration or telemetry for healthy peers.
//!
//! # Handles
//!
//! Registration returns an RAII handle. Dropping it unregisters the
//! connection, so a handler that faults or is cancelled cannot leak an entry.
//!
//! # Backoff
//!
//! ```text
//! record_failure ─▶ error_count += 1
//!                   next_retry_at = now + min(max, base * 2^error_count)
//!                   reconnect_queue[destination] = next_retry_at
//!
//! record_success ─▶ failure entry and queue entry removed
//! ```
//!
//! [`drain_due_reconnects`](ConnectionRegistry::drain_due_reconnects) hands
//! out due destinations lazily. The caller owns the timer.

use crate::collector::StatsHub;
use crate::config::RegistryConfig;
use crate::document::{IncomingConnectionInfo, RejectionRecord, ReplicationDestination};
use crate::error::{ReplicationError, Result};
use crate::handler::{Direction, PerformanceRecorder};
use crate::metrics;
use crate::resilience::RetryConfig;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Registry-assigned id of an incoming connection.
pub type ConnectionId = u64;

/// Failure bookkeeping for one destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutgoingFailureInfo {
    pub destination: ReplicationDestination,
    /// Consecutive failures since the last success.
    pub error_count: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

struct IncomingEntry {
    info: IncomingConnectionInfo,
    connected_at: DateTime<Utc>,
    recorder: Arc<PerformanceRecorder>,
    close_tx: watch::Sender<bool>,
}

struct OutgoingEntry {
    connected_at: DateTime<Utc>,
    recorder: Arc<PerformanceRecorder>,
}

struct RegistryInner {
    retry: RetryConfig,
    rejection_history_limit: usize,
    single_connection_per_source: bool,
    ring_capacity: usize,
    hub: StatsHub,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
    incoming: DashMap<ConnectionId, IncomingEntry>,
    incoming_by_source: DashMap<String, ConnectionId>,
    outgoing: DashMap<ReplicationDestination, OutgoingEntry>,
    failures: DashMap<ReplicationDestination, OutgoingFailureInfo>,
    reconnect_queue: DashMap<ReplicationDestination, DateTime<Utc>>,
    rejections: DashMap<IncomingConnectionInfo, VecDeque<RejectionRecord>>,
    last_activity: DashMap<IncomingConnectionInfo, DateTime<Utc>>,
}

/// Thread-safe bookkeeping of every replication connection of one database.
/// Cheap to clone.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

fn add_backoff(now: DateTime<Utc>, backoff: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(backoff)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl ConnectionRegistry {
    /// `hub` receives every sample produced by registered connections;
    /// each connection retains its last `ring_capacity` samples.
    pub fn new(config: &RegistryConfig, hub: StatsHub, ring_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                retry: config.retry_config(),
                rejection_history_limit: config.rejection_history_limit.max(1),
                single_connection_per_source: config.single_connection_per_source,
                ring_capacity,
                hub,
                next_id: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
                incoming: DashMap::new(),
                incoming_by_source: DashMap::new(),
                outgoing: DashMap::new(),
                failures: DashMap::new(),
                reconnect_queue: DashMap::new(),
                rejections: DashMap::new(),
                last_activity: DashMap::new(),
            }),
        }
    }

    /// Refuse further registrations.
    pub fn begin_shutdown(&self) {
        if !self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            info!("Connection registry shutting down");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    // =========================================================================
    // Incoming
    // =========================================================================

    /// Register an accepted incoming connection.
    ///
    /// With the single-connection-per-source policy, an older connection
    /// from the same source database is told to close; the newer one wins.
    pub fn register_incoming(&self, info: IncomingConnectionInfo) -> Result<IncomingHandle> {
        if self.is_shutting_down() {
            return Err(ReplicationError::ShuttingDown);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (close_tx, close_rx) = watch::channel(false);
        let recorder = Arc::new(PerformanceRecorder::new(
            Direction::Incoming,
            info.source_database_id.clone(),
            self.inner.ring_capacity,
            self.inner.hub.clone(),
        ));

        self.inner.incoming.insert(
            id,
            IncomingEntry {
                info: info.clone(),
                connected_at: Utc::now(),
                recorder: Arc::clone(&recorder),
                close_tx,
            },
        );

        if self.inner.single_connection_per_source {
            let previous = self.inner.incoming_by_source.insert(info.source_key(), id);
            if let Some(previous) = previous {
                if let Some(entry) = self.inner.incoming.get(&previous) {
                    entry.close_tx.send_replace(true);
                    info!(source = %info, superseded = previous, connection = id, "Newer connection supersedes existing one");
                }
            }
        }

        metrics::set_incoming_connections(self.inner.incoming.len());
        debug!(source = %info, connection = id, "Incoming connection registered");

        Ok(IncomingHandle {
            registry: self.clone(),
            id,
            info,
            recorder,
            close_rx,
        })
    }

    fn unregister_incoming(&self, id: ConnectionId) {
        if let Some((_, entry)) = self.inner.incoming.remove(&id) {
            self.inner
                .incoming_by_source
                .remove_if(&entry.info.source_key(), |_, current| *current == id);
            debug!(source = %entry.info, connection = id, "Incoming connection unregistered");
        }
        metrics::set_incoming_connections(self.inner.incoming.len());
    }

    /// Append to the bounded rejection history of `source`.
    pub fn record_rejection(&self, source: &IncomingConnectionInfo, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(source = %source, reason = %reason, "Incoming connection rejected");
        metrics::record_incoming_rejection(&source.source_database_id);

        let mut history = self.inner.rejections.entry(source.clone()).or_default();
        history.push_back(RejectionRecord {
            reason,
            when: Utc::now(),
        });
        while history.len() > self.inner.rejection_history_limit {
            history.pop_front();
        }
    }

    /// Note traffic from `source`.
    pub fn touch_incoming(&self, source: &IncomingConnectionInfo) {
        self.inner.last_activity.insert(source.clone(), Utc::now());
    }

    // =========================================================================
    // Outgoing
    // =========================================================================

    /// Register an outgoing connection to `destination`.
    ///
    /// Returns `Ok(None)` if one is already registered.
    pub fn register_outgoing(&self, destination: &ReplicationDestination) -> Result<Option<OutgoingHandle>> {
        if self.is_shutting_down() {
            return Err(ReplicationError::ShuttingDown);
        }

        let recorder = match self.inner.outgoing.entry(destination.clone()) {
            Entry::Occupied(_) => {
                debug!(destination = %destination, "Outgoing connection already registered");
                return Ok(None);
            }
            Entry::Vacant(vacant) => {
                let recorder = Arc::new(PerformanceRecorder::new(
                    Direction::Outgoing,
                    destination.to_string(),
                    self.inner.ring_capacity,
                    self.inner.hub.clone(),
                ));
                vacant.insert(OutgoingEntry {
                    connected_at: Utc::now(),
                    recorder: Arc::clone(&recorder),
                });
                recorder
            }
        };

        metrics::set_outgoing_connections(self.inner.outgoing.len());
        debug!(destination = %destination, "Outgoing connection registered");

        Ok(Some(OutgoingHandle {
            registry: self.clone(),
            destination: destination.clone(),
            recorder,
        }))
    }

    fn unregister_outgoing(&self, destination: &ReplicationDestination) {
        self.inner.outgoing.remove(destination);
        metrics::set_outgoing_connections(self.inner.outgoing.len());
        debug!(destination = %destination, "Outgoing connection unregistered");
    }

    /// Count a failure, schedule a reconnect and return the backoff.
    pub fn record_failure(&self, destination: &ReplicationDestination, error: &ReplicationError) -> Duration {
        self.record_failure_at(destination, error, Utc::now())
    }

    /// [`record_failure`](Self::record_failure) with an explicit clock.
    pub fn record_failure_at(
        &self,
        destination: &ReplicationDestination,
        error: &ReplicationError,
        now: DateTime<Utc>,
    ) -> Duration {
        let (error_count, backoff, next_retry_at) = {
            let mut info = self
                .inner
                .failures
                .entry(destination.clone())
                .or_insert_with(|| OutgoingFailureInfo {
                    destination: destination.clone(),
                    error_count: 0,
                    next_retry_at: now,
                    last_error: None,
                });
            info.error_count = info.error_count.saturating_add(1);
            let backoff = self.inner.retry.delay_for_attempt(info.error_count);
            info.next_retry_at = add_backoff(now, backoff);
            info.last_error = Some(error.to_string());
            (info.error_count, backoff, info.next_retry_at)
        };

        self.inner.reconnect_queue.insert(destination.clone(), next_retry_at);
        metrics::record_outgoing_failure(&destination.to_string(), error.kind(), error_count, backoff);
        warn!(
            destination = %destination,
            error = %error,
            error_count,
            backoff_ms = backoff.as_millis() as u64,
            "Outgoing replication failed"
        );
        backoff
    }

    /// Clear failure state for `destination`.
    pub fn record_success(&self, destination: &ReplicationDestination) {
        let had_failures = self.inner.failures.remove(destination).is_some();
        self.inner.reconnect_queue.remove(destination);
        if had_failures {
            metrics::record_outgoing_success(&destination.to_string());
            info!(destination = %destination, "Outgoing replication recovered");
        }
    }

    /// Destinations whose backoff elapsed by `now`, earliest first.
    ///
    /// Lazy: each destination is removed from the queue only when the
    /// iterator yields it, so stopping early leaves the rest queued for the
    /// next sweep. Entries re-queued with a later time meanwhile are skipped.
    pub fn drain_due_reconnects(&self, now: DateTime<Utc>) -> impl Iterator<Item = ReplicationDestination> + '_ {
        let mut due: Vec<(ReplicationDestination, DateTime<Utc>)> = self
            .inner
            .reconnect_queue
            .iter()
            .filter(|e| *e.value() <= now)
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        due.sort_by_key(|(_, at)| *at);

        due.into_iter().filter_map(move |(destination, _)| {
            self.inner
                .reconnect_queue
                .remove_if(&destination, |_, at| *at <= now)
                .map(|(destination, _)| destination)
        })
    }

    // =========================================================================
    // Views
    // =========================================================================

    pub fn incoming_connections(&self) -> Vec<IncomingConnectionInfo> {
        let mut entries: Vec<(DateTime<Utc>, IncomingConnectionInfo)> = self
            .inner
            .incoming
            .iter()
            .map(|e| (e.connected_at, e.info.clone()))
            .collect();
        entries.sort_by_key(|(at, _)| *at);
        entries.into_iter().map(|(_, info)| info).collect()
    }

    pub fn outgoing_destinations(&self) -> Vec<ReplicationDestination> {
        let mut entries: Vec<(DateTime<Utc>, ReplicationDestination)> = self
            .inner
            .outgoing
            .iter()
            .map(|e| (e.connected_at, e.key().clone()))
            .collect();
        entries.sort_by_key(|(at, _)| *at);
        entries.into_iter().map(|(_, d)| d).collect()
    }

    pub fn incoming_recorders(&self) -> Vec<(IncomingConnectionInfo, Arc<PerformanceRecorder>)> {
        self.inner
            .incoming
            .iter()
            .map(|e| (e.info.clone(), Arc::clone(&e.recorder)))
            .collect()
    }

    pub fn outgoing_recorders(&self) -> Vec<(ReplicationDestination, Arc<PerformanceRecorder>)> {
        self.inner
            .outgoing
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(&e.recorder)))
            .collect()
    }

    pub fn failure_info(&self, destination: &ReplicationDestination) -> Option<OutgoingFailureInfo> {
        self.inner.failures.get(destination).map(|e| e.clone())
    }

    pub fn outgoing_failures(&self) -> Vec<OutgoingFailureInfo> {
        self.inner.failures.iter().map(|e| e.value().clone()).collect()
    }

    pub fn last_activity(&self) -> Vec<(IncomingConnectionInfo, DateTime<Utc>)> {
        self.inner
            .last_activity
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    pub fn rejections(&self) -> Vec<(IncomingConnectionInfo, Vec<RejectionRecord>)> {
        self.inner
            .rejections
            .iter()
            .map(|e| (e.key().clone(), e.value().iter().cloned().collect()))
            .collect()
    }

    /// Destinations waiting out their backoff, with due times.
    pub fn reconnect_queue(&self) -> Vec<(ReplicationDestination, DateTime<Utc>)> {
        let mut queue: Vec<_> = self
            .inner
            .reconnect_queue
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        queue.sort_by_key(|(_, at)| *at);
        queue
    }

    pub fn incoming_count(&self) -> usize {
        self.inner.incoming.len()
    }

    pub fn outgoing_count(&self) -> usize {
        self.inner.outgoing.len()
    }
}

/// Live incoming registration. Unregisters on drop.
pub struct IncomingHandle {
    registry: ConnectionRegistry,
    id: ConnectionId,
    info: IncomingConnectionInfo,
    recorder: Arc<PerformanceRecorder>,
    close_rx: watch::Receiver<bool>,
}

impl IncomingHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn info(&self) -> &IncomingConnectionInfo {
        &self.info
    }

    pub fn recorder(&self) -> &Arc<PerformanceRecorder> {
        &self.recorder
    }

    /// Signals `true` when a newer connection from the same source took over.
    pub fn superseded(&self) -> watch::Receiver<bool> {
        self.close_rx.clone()
    }
}

impl Drop for IncomingHandle {
    fn drop(&mut self) {
        self.registry.unregister_incoming(self.id);
    }
}

/// Live outgoing registration. Unregisters on drop.
pub struct OutgoingHandle {
    registry: ConnectionRegistry,
    destination: ReplicationDestination,
    recorder: Arc<PerformanceRecorder>,
}

impl OutgoingHandle {
    pub fn destination(&self) -> &ReplicationDestination {
        &self.destination
    }

    pub fn recorder(&self) -> &Arc<PerformanceRecorder> {
        &self.recorder
    }
}

impl Drop for OutgoingHandle {
    fn drop(&mut self) {
        self.registry.unregister_outgoing(&self.destination);
    }
}
