//! Outbound replication to one destination.
//!
//! ```text
//! Connecting ─▶ Handshaking ─▶ Idle ⇄ Sending ─▶ Closing ─▶ Closed
//!      │             │          │        │
//!      └─────────────┴──────────┴────────┴──(error / ack timeout)──▶ Faulted
//! ```
//!
//! # Send Cycle
//!
//! 1. Read up to `batch_size` changes past the acknowledged watermark
//! 2. Ship them as one checksummed batch
//! 3. Wait up to `ack_timeout` for the matching `BatchAck`
//! 4. Clear failure state, advance the watermark, record a sample
//!
//! When caught up the handler idles until storage publishes a new etag,
//! sending a heartbeat every `heartbeat_interval` so a dead transport
//! surfaces as a send error.
//!
//! # Failure
//!
//! Any error is reported to the registry, which schedules a reconnect after
//! backoff. The handler itself never retries.

use super::{Direction, HandlerContext, HandlerState, SampleBuilder, StateMachine};
use crate::collector::wait_for_shutdown;
use crate::document::ReplicationDestination;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::registry::OutgoingHandle;
use crate::transport::{Connector, ReplicationBatch, ReplicationChannel, ReplicationMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Keeps one destination up to date with local changes.
pub struct OutgoingReplicationHandler {
    ctx: HandlerContext,
    connector: Arc<dyn Connector>,
    destination: ReplicationDestination,
    state: StateMachine,
}

impl OutgoingReplicationHandler {
    pub fn new(ctx: HandlerContext, connector: Arc<dyn Connector>, destination: ReplicationDestination) -> Self {
        Self {
            ctx,
            connector,
            destination,
            state: StateMachine::new(Direction::Outgoing),
        }
    }

    pub fn destination(&self) -> &ReplicationDestination {
        &self.destination
    }

    pub fn state(&self) -> watch::Receiver<HandlerState> {
        self.state.subscribe()
    }

    /// Run until shutdown or failure.
    ///
    /// Returns `Ok(())` without connecting when the destination is disabled
    /// or another handler already serves it.
    pub async fn run(self) -> Result<()> {
        let span = info_span!("outgoing", destination = %self.destination);

        async move {
            if self.destination.disabled {
                debug!("Destination disabled, not connecting");
                self.state.close();
                return Ok(());
            }
            let handle = match self.ctx.registry.register_outgoing(&self.destination) {
                Ok(Some(handle)) => handle,
                Ok(None) => {
                    self.state.close();
                    return Ok(());
                }
                Err(e) => {
                    self.state.fault();
                    return Err(e);
                }
            };

            let mut channel: Option<Box<dyn ReplicationChannel>> = None;
            let result = self.replicate(&handle, &mut channel).await;
            // Unregister before scheduling a reconnect so the retry can register.
            drop(handle);
            match &result {
                Ok(()) => self.state.close(),
                Err(e) => {
                    self.ctx.registry.record_failure(&self.destination, e);
                    self.state.fault();
                }
            }
            if let Some(mut channel) = channel {
                if let Err(e) = channel.close().await {
                    debug!(error = %e, "Error closing outgoing channel");
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn replicate(
        &self,
        handle: &OutgoingHandle,
        slot: &mut Option<Box<dyn ReplicationChannel>>,
    ) -> Result<()> {
        let connect_timeout = self.ctx.outgoing.connect_timeout_duration();
        let connected = tokio::select! {
            biased;
            _ = wait_for_shutdown(self.ctx.shutdown_rx.clone()) => return Ok(()),
            connected = tokio::time::timeout(connect_timeout, self.connector.connect(&self.destination)) => connected,
        };
        let channel = slot.insert(connected.map_err(|_| {
            ReplicationError::transport(self.destination.to_string(), format!("connect timed out after {:?}", connect_timeout))
        })??);

        self.state.transition(HandlerState::Handshaking)?;
        channel
            .send(ReplicationMessage::Handshake {
                source: self.ctx.identity.clone(),
                target_database: self.destination.database.clone(),
            })
            .await?;

        let mut watermark = match self.await_reply(&mut **channel).await? {
            None => return Ok(()),
            Some(ReplicationMessage::HandshakeAck {
                accepted: true,
                last_accepted_etag,
                ..
            }) => last_accepted_etag,
            Some(ReplicationMessage::HandshakeAck { reason, .. }) => {
                return Err(ReplicationError::Rejected {
                    source_id: self.ctx.identity.source_database_id.clone(),
                    reason: reason.unwrap_or_else(|| "no reason given".to_string()),
                })
            }
            Some(other) => return Err(self.unexpected(other)),
        };
        self.ctx.watermarks.set_outgoing(&self.destination, watermark).await;
        self.state.transition(HandlerState::Idle)?;
        info!(watermark, "Outgoing replication connected");

        let batch_size = self.ctx.outgoing.batch_size.max(1);
        let heartbeat = self.ctx.outgoing.heartbeat_interval_duration();
        let mut changes = self.ctx.storage.subscribe_changes();

        loop {
            if *self.ctx.shutdown_rx.borrow() {
                return Ok(());
            }
            changes.borrow_and_update();

            let sample = SampleBuilder::start(Direction::Outgoing, self.destination.to_string());
            let items = self.ctx.storage.changes_since(watermark, batch_size).await?;
            if items.is_empty() {
                self.ctx.registry.record_success(&self.destination);
                if !self.idle(&mut **channel, &mut changes, heartbeat).await? {
                    return Ok(());
                }
                continue;
            }

            match self.send_batch(&mut **channel, handle, sample, items).await? {
                Some(acked) => watermark = acked,
                None => return Ok(()),
            }
        }
    }

    /// Wait for new local changes. Returns `false` when the handler should stop.
    async fn idle(
        &self,
        channel: &mut dyn ReplicationChannel,
        changes: &mut watch::Receiver<u64>,
        heartbeat: Duration,
    ) -> Result<bool> {
        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(self.ctx.shutdown_rx.clone()) => return Ok(false),
                changed = changes.changed() => return Ok(changed.is_ok()),
                _ = tokio::time::sleep(heartbeat) => {
                    trace!("Sending heartbeat");
                    channel.send(ReplicationMessage::Heartbeat).await?;
                }
            }
        }
    }

    async fn send_batch(
        &self,
        channel: &mut dyn ReplicationChannel,
        handle: &OutgoingHandle,
        mut sample: SampleBuilder,
        items: Vec<crate::document::ReplicationItem>,
    ) -> Result<Option<u64>> {
        self.state.transition(HandlerState::Sending)?;
        sample.stage("read");

        let batch = ReplicationBatch::new(items)?;
        let last_etag = batch.last_etag;
        let count = batch.items.len();
        let tombstones = batch.tombstone_count();
        channel.send(ReplicationMessage::Batch(batch)).await?;
        sample.stage("send");

        match self.await_reply(channel).await? {
            None => return Ok(None),
            Some(ReplicationMessage::BatchAck { last_etag: acked }) if acked == last_etag => {}
            Some(ReplicationMessage::BatchAck { last_etag: acked }) => {
                return Err(ReplicationError::protocol(
                    self.destination.to_string(),
                    format!("acknowledged etag {} but {} was sent", acked, last_etag),
                ))
            }
            Some(other) => return Err(self.unexpected(other)),
        }
        sample.stage("ack");

        self.ctx.registry.record_success(&self.destination);
        self.ctx.watermarks.set_outgoing(&self.destination, last_etag).await;

        sample.documents = count - tombstones;
        sample.tombstones = tombstones;
        metrics::record_batch_sent(&self.destination.to_string(), count, sample.elapsed());
        debug!(items = count, last_etag, "Batch acknowledged");
        handle.recorder().record(sample.finish()).await;

        self.state.transition(HandlerState::Idle)?;
        Ok(Some(last_etag))
    }

    /// Next frame from the destination, `None` on shutdown.
    async fn await_reply(&self, channel: &mut dyn ReplicationChannel) -> Result<Option<ReplicationMessage>> {
        let timeout = self.ctx.outgoing.ack_timeout_duration();
        let received = tokio::select! {
            biased;
            _ = wait_for_shutdown(self.ctx.shutdown_rx.clone()) => return Ok(None),
            received = tokio::time::timeout(timeout, channel.receive()) => received,
        };
        match received {
            Err(_) => Err(ReplicationError::AckTimeout {
                destination: self.destination.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            Ok(Ok(Some(message))) => Ok(Some(message)),
            Ok(Ok(None)) => Err(ReplicationError::transport(
                self.destination.to_string(),
                "destination closed the connection",
            )),
            Ok(Err(e)) => Err(e),
        }
    }

    fn unexpected(&self, message: ReplicationMessage) -> ReplicationError {
        match message {
            ReplicationMessage::Error { message } => {
                warn!(message = %message, "Destination reported an error");
                ReplicationError::transport(self.destination.to_string(), format!("peer reported: {}", message))
            }
            other => ReplicationError::protocol(
                self.destination.to_string(),
                format!("unexpected {} frame", other.kind()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::context;
    use super::*;
    use crate::document::{IncomingConnectionInfo, ReplicationItem};
    use crate::transport::{MemoryChannel, MemoryNetwork};
    use serde_json::json;

    const URL: &str = "http://b:8080";

    async fn accept(listener: &mut tokio::sync::mpsc::UnboundedReceiver<MemoryChannel>) -> MemoryChannel {
        tokio::time::timeout(Duration::from_secs(5), listener.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn expect(peer: &mut MemoryChannel) -> ReplicationMessage {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), peer.receive())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if message != ReplicationMessage::Heartbeat {
                return message;
            }
        }
    }

    async fn expect_handshake(peer: &mut MemoryChannel) -> IncomingConnectionInfo {
        match expect(peer).await {
            ReplicationMessage::Handshake {
                source,
                target_database,
            } => {
                assert_eq!(target_database, "orders");
                source
            }
            other => panic!("expected handshake, got {:?}", other),
        }
    }

    fn accept_from(etag: u64) -> ReplicationMessage {
        ReplicationMessage::HandshakeAck {
            accepted: true,
            reason: None,
            last_accepted_etag: etag,
        }
    }

    fn batch_of(message: ReplicationMessage) -> ReplicationBatch {
        match message {
            ReplicationMessage::Batch(batch) => batch,
            other => panic!("expected batch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ships_changes_and_advances_watermark() {
        let (tx, rx) = watch::channel(false);
        let (ctx, _dir) = context("A", "db-a", "orders", rx).await;
        ctx.storage
            .put_document("users/1", "Users", json!({"n": 1}), Default::default())
            .await
            .unwrap();
        ctx.storage.put_document("users/2", "Users", json!({"n": 2}), Default::default()).await.unwrap();
        ctx.storage.delete_document("users/2").await.unwrap();

        let network = MemoryNetwork::new();
        let mut listener = network.listen(URL, "orders");
        let destination = ReplicationDestination::new(URL, "orders");
        let handler = OutgoingReplicationHandler::new(ctx.clone(), Arc::new(network.connector("db-a")), destination.clone());
        let task = tokio::spawn(handler.run());

        let mut peer = accept(&mut listener).await;
        assert_eq!(expect_handshake(&mut peer).await.source_database_id, "db-a");
        peer.send(accept_from(0)).await.unwrap();

        let batch = batch_of(expect(&mut peer).await);
        assert!(batch.validate("a").is_ok());
        let ids: Vec<&str> = batch.items.iter().map(ReplicationItem::id).collect();
        assert_eq!(ids, vec!["users/1", "users/2"]);
        assert!(batch.items[1].is_tombstone());
        peer.send(ReplicationMessage::BatchAck {
            last_etag: batch.last_etag,
        })
        .await
        .unwrap();

        // A later local write wakes the idle handler
        ctx.storage.put_document("users/3", "Users", json!({"n": 3}), Default::default()).await.unwrap();
        let next = batch_of(expect(&mut peer).await);
        assert_eq!(next.items.len(), 1);
        assert_eq!(next.items[0].id(), "users/3");
        assert_eq!(ctx.watermarks.outgoing(&destination).await, batch.last_etag);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(ctx.registry.failure_info(&destination).is_none());
        assert_eq!(ctx.registry.outgoing_count(), 0);
    }

    #[tokio::test]
    async fn test_resumes_from_peer_watermark() {
        let (_tx, rx) = watch::channel(false);
        let (ctx, _dir) = context("A", "db-a", "orders", rx).await;
        for i in 0..3 {
            ctx.storage
                .put_document(&format!("users/{}", i), "Users", json!({}), Default::default())
                .await
                .unwrap();
        }
        let network = MemoryNetwork::new();
        let mut listener = network.listen(URL, "orders");
        let handler = OutgoingReplicationHandler::new(
            ctx.clone(),
            Arc::new(network.connector("db-a")),
            ReplicationDestination::new(URL, "orders"),
        );
        let task = tokio::spawn(handler.run());

        let mut peer = accept(&mut listener).await;
        expect_handshake(&mut peer).await;
        peer.send(accept_from(2)).await.unwrap();
        let batch = batch_of(expect(&mut peer).await);
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].id(), "users/2");

        drop(peer);
        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_ack_timeout_records_failure() {
        let (_tx, rx) = watch::channel(false);
        let (ctx, _dir) = context("A", "db-a", "orders", rx).await;
        ctx.storage.put_document("users/1", "Users", json!({}), Default::default()).await.unwrap();
        let network = MemoryNetwork::new();
        let mut listener = network.listen(URL, "orders");
        let destination = ReplicationDestination::new(URL, "orders");
        let handler = OutgoingReplicationHandler::new(ctx.clone(), Arc::new(network.connector("db-a")), destination.clone());
        let state = handler.state();
        let task = tokio::spawn(handler.run());

        let mut peer = accept(&mut listener).await;
        expect_handshake(&mut peer).await;
        peer.send(accept_from(0)).await.unwrap();
        batch_of(expect(&mut peer).await);
        // Never acknowledge

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ReplicationError::AckTimeout { .. }));
        assert_eq!(*state.borrow(), HandlerState::Faulted);
        let info = ctx.registry.failure_info(&destination).unwrap();
        assert_eq!(info.error_count, 1);
        assert_eq!(ctx.registry.reconnect_queue().len(), 1);
        assert_eq!(ctx.watermarks.outgoing(&destination).await, 0);
    }

    #[tokio::test]
    async fn test_unreachable_destination_records_failure() {
        let (_tx, rx) = watch::channel(false);
        let (ctx, _dir) = context("A", "db-a", "orders", rx).await;
        let destination = ReplicationDestination::new(URL, "orders");
        let handler = OutgoingReplicationHandler::new(
            ctx.clone(),
            Arc::new(MemoryNetwork::new().connector("db-a")),
            destination.clone(),
        );
        let err = handler.run().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Transport { .. }));
        assert_eq!(ctx.registry.failure_info(&destination).unwrap().error_count, 1);
    }

    #[tokio::test]
    async fn test_rejected_handshake_is_a_failure() {
        let (_tx, rx) = watch::channel(false);
        let (ctx, _dir) = context("A", "db-a", "orders", rx).await;
        let network = MemoryNetwork::new();
        let mut listener = network.listen(URL, "orders");
        let destination = ReplicationDestination::new(URL, "orders");
        let task = tokio::spawn(
            OutgoingReplicationHandler::new(ctx.clone(), Arc::new(network.connector("db-a")), destination.clone()).run(),
        );

        let mut peer = accept(&mut listener).await;
        expect_handshake(&mut peer).await;
        peer.send(ReplicationMessage::HandshakeAck {
            accepted: false,
            reason: Some("nope".into()),
            last_accepted_etag: 0,
        })
        .await
        .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ReplicationError::Rejected { .. }));
        assert!(ctx.registry.failure_info(&destination).is_some());
    }

    #[tokio::test]
    async fn test_disabled_and_duplicate_destinations_do_not_connect() {
        let (_tx, rx) = watch::channel(false);
        let (ctx, _dir) = context("A", "db-a", "orders", rx).await;
        let network = MemoryNetwork::new();
        let connector: Arc<dyn Connector> = Arc::new(network.connector("db-a"));

        let mut disabled = ReplicationDestination::new(URL, "orders");
        disabled.disabled = true;
        OutgoingReplicationHandler::new(ctx.clone(), connector.clone(), disabled)
            .run()
            .await
            .unwrap();

        let destination = ReplicationDestination::new(URL, "orders");
        let _held = ctx.registry.register_outgoing(&destination).unwrap().unwrap();
        OutgoingReplicationHandler::new(ctx.clone(), connector, destination.clone())
            .run()
            .await
            .unwrap();
        assert!(ctx.registry.failure_info(&destination).is_none());
    }

    #[tokio::test]
    async fn test_idle_handler_sends_heartbeats() {
        let (tx, rx) = watch::channel(false);
        let (ctx, _dir) = context("A", "db-a", "orders", rx).await;
        let network = MemoryNetwork::new();
        let mut listener = network.listen(URL, "orders");
        let task = tokio::spawn(
            OutgoingReplicationHandler::new(
                ctx.clone(),
                Arc::new(network.connector("db-a")),
                ReplicationDestination::new(URL, "orders"),
            )
            .run(),
        );

        let mut peer = accept(&mut listener).await;
        expect_handshake(&mut peer).await;
        peer.send(accept_from(0)).await.unwrap();
        let heartbeat = tokio::time::timeout(Duration::from_secs(5), peer.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(heartbeat, Some(ReplicationMessage::Heartbeat));

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
