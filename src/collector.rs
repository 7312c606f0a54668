// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Live performance collection.
//!
//! Handlers publish samples to one [`StatsHub`] per database; each
//! [`LiveReplicationPerformanceCollector`] subscribes a bounded queue to it.
//! Handlers created after a collector subscribed reach it through the same
//! hub, so nothing has to re-subscribe when connections come and go.
//!
//! ```text
//! incoming handler ─┐                        ┌─▶ collector A (bounded queue)
//! incoming handler ─┼──▶ StatsHub::publish ──┤
//! outgoing handler ─┘    (read lock)         └─▶ collector B (bounded queue)
//! ```
//!
//! # Unsubscribe handshake
//!
//! Publishing holds the hub's read lock while it enqueues; unsubscribing
//! takes the write lock. Once `unsubscribe` returns no publish can still be
//! delivering to that queue, and everything published before it is already
//! in the queue.
//!
//! # Overflow
//!
//! A full queue drops the new sample and counts it
//! (`replication_live_samples_dropped_total`). Telemetry never blocks a
//! replication handler.

use crate::handler::PerformanceStatsSample;
use crate::metrics;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, trace};

type SubscriberId = u64;

#[derive(Default)]
struct HubInner {
    subscribers: RwLock<HashMap<SubscriberId, mpsc::Sender<PerformanceStatsSample>>>,
    next_id: AtomicU64,
}

/// Fan-out point between handlers and live collectors. Cheap to clone.
#[derive(Clone, Default)]
pub struct StatsHub {
    inner: Arc<HubInner>,
}

impl StatsHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `sample` to every current subscriber without waiting.
    pub async fn publish(&self, sample: &PerformanceStatsSample) {
        let subscribers = self.inner.subscribers.read().await;
        for (id, tx) in subscribers.iter() {
            match tx.try_send(sample.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    trace!(subscriber = id, "Live queue full, sample dropped");
                    metrics::record_live_sample_dropped();
                }
                // Receiver gone; its unsubscribe is on the way
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    async fn subscribe(&self, capacity: usize) -> (SubscriberId, mpsc::Receiver<PerformanceStatsSample>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.inner.subscribers.write().await;
        subscribers.insert(id, tx);
        metrics::set_live_subscribers(subscribers.len());
        (id, rx)
    }

    async fn unsubscribe(&self, id: SubscriberId) {
        let mut subscribers = self.inner.subscribers.write().await;
        subscribers.remove(&id);
        metrics::set_live_subscribers(subscribers.len());
    }

    fn try_unsubscribe(&self, id: SubscriberId) -> bool {
        match self.inner.subscribers.try_write() {
            Ok(mut subscribers) => {
                subscribers.remove(&id);
                metrics::set_live_subscribers(subscribers.len());
                true
            }
            Err(_) => false,
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().await.len()
    }
}

/// Resolves once shutdown is signalled; never if the sender is gone.
pub(crate) async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A monitoring session's view of every handler's samples.
///
/// # Example
///
/// ```rust,no_run
/// # async fn example(engine: &doc_replication::ReplicationEngine) {
/// use std::time::Duration;
///
/// let collector = engine.live_collector().await;
/// let (has_data, samples) = collector.try_dequeue(Duration::from_millis(100)).await;
/// if !has_data {
///     // send a heartbeat to the monitoring client
/// }
/// collector.dispose().await;
/// # }
/// ```
pub struct LiveReplicationPerformanceCollector {
    hub: StatsHub,
    id: SubscriberId,
    queue: tokio::sync::Mutex<mpsc::Receiver<PerformanceStatsSample>>,
    shutdown_rx: watch::Receiver<bool>,
    disposed: AtomicBool,
}

impl LiveReplicationPerformanceCollector {
    /// Subscribe to `hub` with a queue of `capacity` samples.
    pub async fn new(hub: StatsHub, shutdown_rx: watch::Receiver<bool>, capacity: usize) -> Self {
        let (id, rx) = hub.subscribe(capacity).await;
        debug!(subscriber = id, capacity, "Live collector subscribed");
        Self {
            hub,
            id,
            queue: tokio::sync::Mutex::new(rx),
            shutdown_rx,
            disposed: AtomicBool::new(false),
        }
    }

    /// Wait up to `timeout` for samples.
    ///
    /// Returns everything queued once at least one sample arrived, or
    /// `(false, [])` on timeout or shutdown.
    pub async fn try_dequeue(&self, timeout: Duration) -> (bool, Vec<PerformanceStatsSample>) {
        let mut queue = self.queue.lock().await;
        if *self.shutdown_rx.borrow() {
            return (false, Vec::new());
        }

        let first = tokio::select! {
            biased;
            _ = wait_for_shutdown(self.shutdown_rx.clone()) => None,
            received = tokio::time::timeout(timeout, queue.recv()) => received.ok().flatten(),
        };

        let Some(first) = first else {
            return (false, Vec::new());
        };

        let mut samples = vec![first];
        while let Ok(sample) = queue.try_recv() {
            samples.push(sample);
        }
        (true, samples)
    }

    /// Unsubscribe from the hub. Samples already queued stay readable.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.hub.unsubscribe(self.id).await;
        debug!(subscriber = self.id, "Live collector unsubscribed");
    }
}

impl Drop for LiveReplicationPerformanceCollector {
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) || self.hub.try_unsubscribe(self.id) {
            return;
        }
        // Hub busy: finish the unsubscribe on the runtime
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let hub = self.hub.clone();
            let id = self.id;
            handle.spawn(async move { hub.unsubscribe(id).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Direction, SampleBuilder};
    use std::time::Instant;

    fn sample(documents: usize) -> PerformanceStatsSample {
        let mut builder = SampleBuilder::start(Direction::Incoming, "db-b");
        builder.documents = documents;
        builder.finish()
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn test_timeout_without_handlers_returns_empty() {
        let collector = LiveReplicationPerformanceCollector::new(StatsHub::new(), no_shutdown(), 8).await;
        let started = Instant::now();
        let (has_data, samples) = collector.try_dequeue(Duration::from_millis(100)).await;
        assert!(!has_data);
        assert!(samples.is_empty());
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(90));
        assert!(waited < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_dequeue_drains_everything_queued() {
        let hub = StatsHub::new();
        let collector = LiveReplicationPerformanceCollector::new(hub.clone(), no_shutdown(), 8).await;
        for i in 0..3 {
            hub.publish(&sample(i)).await;
        }
        let (has_data, samples) = collector.try_dequeue(Duration::from_millis(100)).await;
        assert!(has_data);
        assert_eq!(samples.iter().map(|s| s.documents).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_every_collector_gets_each_sample() {
        let hub = StatsHub::new();
        let a = LiveReplicationPerformanceCollector::new(hub.clone(), no_shutdown(), 8).await;
        let b = LiveReplicationPerformanceCollector::new(hub.clone(), no_shutdown(), 8).await;
        hub.publish(&sample(7)).await;
        assert_eq!(a.try_dequeue(Duration::from_millis(50)).await.1.len(), 1);
        assert_eq!(b.try_dequeue(Duration::from_millis(50)).await.1.len(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let hub = StatsHub::new();
        let collector = LiveReplicationPerformanceCollector::new(hub.clone(), no_shutdown(), 2).await;
        for i in 0..5 {
            hub.publish(&sample(i)).await;
        }
        let (_, samples) = collector.try_dequeue(Duration::from_millis(50)).await;
        assert_eq!(samples.len(), 2);
    }

    #[tokio::test]
    async fn test_dispose_keeps_queued_and_stops_new() {
        let hub = StatsHub::new();
        let collector = LiveReplicationPerformanceCollector::new(hub.clone(), no_shutdown(), 8).await;
        hub.publish(&sample(1)).await;
        collector.dispose().await;
        assert_eq!(hub.subscriber_count().await, 0);
        hub.publish(&sample(2)).await;

        let (has_data, samples) = collector.try_dequeue(Duration::from_millis(50)).await;
        assert!(has_data);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].documents, 1);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let hub = StatsHub::new();
        {
            let _collector = LiveReplicationPerformanceCollector::new(hub.clone(), no_shutdown(), 8).await;
            assert_eq!(hub.subscriber_count().await, 1);
        }
        assert_eq!(hub.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_wait() {
        let (tx, rx) = watch::channel(false);
        let collector = LiveReplicationPerformanceCollector::new(StatsHub::new(), rx, 8).await;
        let started = Instant::now();
        let wait = collector.try_dequeue(Duration::from_secs(30));
        let trigger = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
        };
        let ((has_data, _), ()) = tokio::join!(wait, trigger);
        assert!(!has_data);
        assert!(started.elapsed() < Duration::from_secs(5));

        // Already shut down: returns immediately
        assert!(!collector.try_dequeue(Duration::from_secs(30)).await.0);
    }
}
