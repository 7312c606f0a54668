//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Incoming batch application and per-item outcomes
//! - Outgoing batch delivery, failures and backoff
//! - Connection counts and handler state transitions
//! - Conflict creation and resolution
//! - Live telemetry queue drops
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use doc_replication::metrics;
//! use std::time::Duration;
//!
//! metrics::record_batch_applied("db-a", 40, 2, Duration::from_millis(12));
//! metrics::record_outgoing_failure("orders@http://b:8080", "ack_timeout", 3, Duration::from_secs(4));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Incoming
// =============================================================================

/// Record a batch applied by an incoming handler.
pub fn record_batch_applied(source: &str, documents: usize, tombstones: usize, duration: Duration) {
    counter!("replication_incoming_batches_total", "source" => source.to_string()).increment(1);
    counter!("replication_incoming_documents_total", "source" => source.to_string())
        .increment(documents as u64);
    counter!("replication_incoming_tombstones_total", "source" => source.to_string())
        .increment(tombstones as u64);
    histogram!("replication_incoming_batch_duration_seconds", "source" => source.to_string())
        .record(duration.as_secs_f64());
}

/// Record per-item outcome counts of an applied batch.
pub fn record_apply_outcomes(source: &str, accepted: usize, conflicts: usize, superseded: usize) {
    counter!("replication_items_total", "source" => source.to_string(), "outcome" => "accepted")
        .increment(accepted as u64);
    counter!("replication_items_total", "source" => source.to_string(), "outcome" => "conflict")
        .increment(conflicts as u64);
    counter!("replication_items_total", "source" => source.to_string(), "outcome" => "superseded")
        .increment(superseded as u64);
}

/// Record a refused incoming connection.
pub fn record_incoming_rejection(source: &str) {
    counter!("replication_incoming_rejections_total", "source" => source.to_string()).increment(1);
}

// =============================================================================
// Outgoing
// =============================================================================

/// Record a batch acknowledged by a destination.
pub fn record_batch_sent(destination: &str, items: usize, duration: Duration) {
    counter!("replication_outgoing_batches_total", "destination" => destination.to_string()).increment(1);
    counter!("replication_outgoing_items_total", "destination" => destination.to_string())
        .increment(items as u64);
    histogram!("replication_outgoing_batch_duration_seconds", "destination" => destination.to_string())
        .record(duration.as_secs_f64());
}

/// Record a destination failure and the backoff it earned.
pub fn record_outgoing_failure(destination: &str, kind: &str, error_count: u32, backoff: Duration) {
    counter!(
        "replication_outgoing_failures_total",
        "destination" => destination.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
    gauge!("replication_outgoing_error_count", "destination" => destination.to_string())
        .set(error_count as f64);
    gauge!("replication_outgoing_backoff_seconds", "destination" => destination.to_string())
        .set(backoff.as_secs_f64());
}

/// Record a destination recovering.
pub fn record_outgoing_success(destination: &str) {
    gauge!("replication_outgoing_error_count", "destination" => destination.to_string()).set(0.0);
    gauge!("replication_outgoing_backoff_seconds", "destination" => destination.to_string()).set(0.0);
}

/// Record destinations handed back by the reconnect sweep.
pub fn record_reconnects(count: usize) {
    counter!("replication_reconnects_total").increment(count as u64);
}

// =============================================================================
// Connections and handler state
// =============================================================================

/// Set current incoming connection count.
pub fn set_incoming_connections(count: usize) {
    gauge!("replication_incoming_connections").set(count as f64);
}

/// Set current outgoing connection count.
pub fn set_outgoing_connections(count: usize) {
    gauge!("replication_outgoing_connections").set(count as f64);
}

/// Record a handler state transition.
pub fn record_handler_state(direction: &str, state: &str) {
    counter!(
        "replication_handler_transitions_total",
        "direction" => direction.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

// =============================================================================
// Conflicts
// =============================================================================

/// Record conflicts detected while applying replicated writes.
pub fn record_conflicts_created(count: usize) {
    if count > 0 {
        counter!("replication_conflicts_created_total").increment(count as u64);
    }
}

/// Record a committed conflict resolution.
pub fn record_conflict_resolved() {
    counter!("replication_conflicts_resolved_total").increment(1);
}

// =============================================================================
// Telemetry and storage
// =============================================================================

/// Record a performance sample dropped because a live queue was full.
pub fn record_live_sample_dropped() {
    counter!("replication_live_samples_dropped_total").increment(1);
}

/// Set number of live collectors currently subscribed.
pub fn set_live_subscribers(count: usize) {
    gauge!("replication_live_subscribers").set(count as f64);
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn storage_retries_total(operation: &str) {
    counter!("replication_storage_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record watermark flush batch (debounced writes).
pub fn record_watermark_flush(flushed: usize, errors: usize) {
    counter!("replication_watermark_flushes_total").increment(1);
    counter!("replication_watermark_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("replication_watermark_flush_errors_total").increment(errors as u64);
    }
}

/// Set engine state gauge.
pub fn set_engine_state(state: &str) {
    gauge!("replication_engine_state", "state" => state.to_string()).set(1.0);
}
