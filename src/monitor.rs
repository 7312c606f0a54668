//! Monitoring views and the live performance session.
//!
//! The DTOs here are the shapes an HTTP layer serializes: PascalCase field
//! names, `{ Key, Value }` pairs for the debug maps and `Queue-Info` for the
//! reconnect queue. Building them only reads the registry and storage.
//!
//! # Live Session
//!
//! ```text
//! first wait (100ms) ──▶ Results | Heartbeat ──▶ wait (4s) ──▶ Results | Heartbeat ──▶ ...
//! ```
//!
//! A session ends when the sink closes or shutdown fires; an idle wait only
//! produces a heartbeat.

use crate::collector::LiveReplicationPerformanceCollector;
use crate::document::{ConflictVersion, IncomingConnectionInfo, Metadata, RejectionRecord, ReplicationDestination, Tombstone};
use crate::error::ReplicationError;
use crate::handler::PerformanceStatsSample;
use crate::registry::ConnectionRegistry;
use crate::transport::BoxFuture;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

pub use crate::storage::{ConflictSummary, ConflictsPage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TombstonesPage {
    pub results: Vec<Tombstone>,
}

/// One competing version of a conflicted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConflictEntry {
    pub change_vector: String,
    /// `None` for a deletion.
    pub doc: Option<serde_json::Value>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DocumentConflicts {
    pub id: String,
    pub largest_etag: u64,
    pub results: Vec<ConflictEntry>,
}

impl DocumentConflicts {
    pub fn from_versions(id: &str, versions: &[ConflictVersion]) -> Self {
        Self {
            id: id.to_string(),
            largest_etag: versions.iter().map(|v| v.etag).max().unwrap_or(0),
            results: versions
                .iter()
                .map(|v| ConflictEntry {
                    change_vector: v.change_vector.to_string(),
                    doc: v.body.clone(),
                    last_modified: v.last_modified,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IncomingPerformance {
    pub source: String,
    pub performance: Vec<PerformanceStatsSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutgoingPerformance {
    pub destination: String,
    pub performance: Vec<PerformanceStatsSample>,
}

/// Retained samples of every live handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PerformanceSnapshot {
    pub incoming: Vec<IncomingPerformance>,
    pub outgoing: Vec<OutgoingPerformance>,
}

impl PerformanceSnapshot {
    pub async fn collect(registry: &ConnectionRegistry) -> Self {
        let mut incoming = Vec::new();
        for (info, recorder) in registry.incoming_recorders() {
            incoming.push(IncomingPerformance {
                source: info.to_string(),
                performance: recorder.recent().await,
            });
        }
        let mut outgoing = Vec::new();
        for (destination, recorder) in registry.outgoing_recorders() {
            outgoing.push(OutgoingPerformance {
                destination: destination.to_string(),
                performance: recorder.recent().await,
            });
        }
        incoming.sort_by(|a, b| a.source.cmp(&b.source));
        outgoing.sort_by(|a, b| a.destination.cmp(&b.destination));
        Self { incoming, outgoing }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActiveConnections {
    pub incoming_connections: Vec<IncomingConnectionInfo>,
    pub outgoing_connections: Vec<ReplicationDestination>,
}

impl ActiveConnections {
    pub fn collect(registry: &ConnectionRegistry) -> Self {
        Self {
            incoming_connections: registry.incoming_connections(),
            outgoing_connections: registry.outgoing_destinations(),
        }
    }
}

/// `{ "Key": ..., "Value": ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyValue<K, V> {
    pub key: K,
    pub value: V,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FailureStat {
    pub error_count: u32,
    pub next_timeout: DateTime<Utc>,
}

/// `{ "Stats": [...] }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Stats<T> {
    pub stats: Vec<T>,
}

pub type OutgoingFailureStats = Stats<KeyValue<ReplicationDestination, FailureStat>>;
pub type IncomingActivityStats = Stats<KeyValue<IncomingConnectionInfo, DateTime<Utc>>>;
pub type IncomingRejectionStats = Stats<KeyValue<IncomingConnectionInfo, Vec<RejectionRecord>>>;

pub fn outgoing_failures(registry: &ConnectionRegistry) -> OutgoingFailureStats {
    let mut stats: Vec<_> = registry
        .outgoing_failures()
        .into_iter()
        .map(|info| KeyValue {
            key: info.destination,
            value: FailureStat {
                error_count: info.error_count,
                next_timeout: info.next_retry_at,
            },
        })
        .collect();
    stats.sort_by_key(|kv| kv.value.next_timeout);
    Stats { stats }
}

pub fn incoming_last_activity(registry: &ConnectionRegistry) -> IncomingActivityStats {
    let mut stats: Vec<_> = registry
        .last_activity()
        .into_iter()
        .map(|(key, value)| KeyValue { key, value })
        .collect();
    stats.sort_by(|a, b| b.value.cmp(&a.value));
    Stats { stats }
}

pub fn incoming_rejections(registry: &ConnectionRegistry) -> IncomingRejectionStats {
    Stats {
        stats: registry
            .rejections()
            .into_iter()
            .map(|(key, value)| KeyValue { key, value })
            .collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectQueueInfo {
    #[serde(rename = "Queue-Info")]
    pub queue_info: Vec<ReplicationDestination>,
}

impl ReconnectQueueInfo {
    pub fn collect(registry: &ConnectionRegistry) -> Self {
        Self {
            queue_info: registry.reconnect_queue().into_iter().map(|(d, _)| d).collect(),
        }
    }
}

/// Advisor output as returned to an operator. Never committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConflictResolutionSuggestion {
    pub document: serde_json::Value,
    pub metadata: Metadata,
}

// =============================================================================
// Live session
// =============================================================================

/// What a live session pushes: `{"Results": [...]}` or `"Heartbeat"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiveFrame {
    Results(Vec<PerformanceStatsSample>),
    Heartbeat,
}

/// Outbound side of a monitoring session (a WebSocket in a server).
pub trait LiveSink: Send {
    fn send(&mut self, frame: LiveFrame) -> BoxFuture<'_, ()>;

    /// Whether the client went away.
    fn is_closed(&self) -> bool;
}

impl LiveSink for mpsc::Sender<LiveFrame> {
    fn send(&mut self, frame: LiveFrame) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            mpsc::Sender::send(self, frame)
                .await
                .map_err(|_| ReplicationError::transport("live-session", "client disconnected"))
        })
    }

    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }
}

/// Frames a finished session pushed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveSessionSummary {
    pub result_frames: u64,
    pub heartbeats: u64,
}

/// Push samples (or heartbeats) to `sink` until it closes or shutdown fires.
/// Disposes `collector` on exit.
pub async fn run_live_session<S: LiveSink>(
    collector: LiveReplicationPerformanceCollector,
    sink: &mut S,
    first_wait: Duration,
    heartbeat_wait: Duration,
    shutdown_rx: watch::Receiver<bool>,
) -> LiveSessionSummary {
    let mut summary = LiveSessionSummary::default();
    let mut wait = first_wait;

    loop {
        if sink.is_closed() || *shutdown_rx.borrow() {
            break;
        }
        let (has_data, samples) = collector.try_dequeue(wait).await;
        wait = heartbeat_wait;
        if *shutdown_rx.borrow() {
            break;
        }

        let frame = if has_data {
            summary.result_frames += 1;
            LiveFrame::Results(samples)
        } else {
            summary.heartbeats += 1;
            LiveFrame::Heartbeat
        };
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "Live session sink closed");
            break;
        }
    }

    collector.dispose().await;
    debug!(
        results = summary.result_frames,
        heartbeats = summary.heartbeats,
        "Live session ended"
    );
    summary
}
