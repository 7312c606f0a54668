//! Inbound replication.
//!
//! ```text
//! Connecting ─▶ Handshaking ──(accepted)──▶ Idle ⇄ Streaming ─▶ Closing ─▶ Closed
//!                    │                        │        │
//!                    └──(rejected)─▶ Closed   └────────┴──(error)──▶ Faulted
//! ```
//!
//! # Batch Handling
//!
//! 1. Validate checksum, ids and change vectors (protocol violation on failure)
//! 2. Charge the rate limiter, if any
//! 3. Apply every item in one storage transaction
//! 4. Advance the per-source watermark, then acknowledge
//! 5. Record a performance sample
//!
//! Nothing is acknowledged before it is committed, so a connection dropped
//! mid-batch leaves either the whole batch or none of it applied, and the
//! sender re-sends from the last acknowledged etag.

use super::{Direction, HandlerContext, HandlerState, SampleBuilder, StateMachine};
use crate::collector::wait_for_shutdown;
use crate::document::IncomingConnectionInfo;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::registry::IncomingHandle;
use crate::transport::{ReplicationBatch, ReplicationChannel, ReplicationMessage};
use tokio::sync::watch;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Serves one inbound replication channel until it closes, faults, is
/// superseded or the engine shuts down.
pub struct IncomingReplicationHandler {
    ctx: HandlerContext,
    channel: Box<dyn ReplicationChannel>,
    state: StateMachine,
}

impl IncomingReplicationHandler {
    pub fn new(ctx: HandlerContext, channel: Box<dyn ReplicationChannel>) -> Self {
        Self {
            ctx,
            channel,
            state: StateMachine::new(Direction::Incoming),
        }
    }

    pub fn state(&self) -> watch::Receiver<HandlerState> {
        self.state.subscribe()
    }

    /// Run to completion. Returns the error that ended the connection, if any.
    pub async fn run(mut self) -> Result<()> {
        let peer = self.channel.peer().to_string();
        let span = info_span!("incoming", peer = %peer);

        async move {
            let result = self.serve().await;
            match &result {
                Ok(()) => self.state.close(),
                Err(ReplicationError::Rejected { .. }) => self.state.close(),
                Err(e) => {
                    warn!(error = %e, "Incoming replication faulted");
                    self.state.fault();
                    if matches!(e, ReplicationError::ProtocolViolation { .. }) {
                        let _ = self
                            .channel
                            .send(ReplicationMessage::Error { message: e.to_string() })
                            .await;
                    }
                }
            }
            if let Err(e) = self.channel.close().await {
                debug!(error = %e, "Error closing incoming channel");
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn serve(&mut self) -> Result<()> {
        let peer = self.channel.peer().to_string();
        self.state.transition(HandlerState::Handshaking)?;

        let timeout = self.ctx.incoming.handshake_timeout_duration();
        let received = tokio::select! {
            biased;
            _ = wait_for_shutdown(self.ctx.shutdown_rx.clone()) => return Ok(()),
            received = tokio::time::timeout(timeout, self.channel.receive()) => received,
        };
        let message = received
            .map_err(|_| ReplicationError::protocol(&peer, format!("no handshake within {:?}", timeout)))??;

        let (source, target_database) = match message {
            Some(ReplicationMessage::Handshake {
                source,
                target_database,
            }) => (source, target_database),
            Some(other) => {
                return Err(ReplicationError::protocol(
                    &peer,
                    format!("expected handshake, got {}", other.kind()),
                ))
            }
            None => return Err(ReplicationError::transport(&peer, "closed before handshake")),
        };

        if let Some(reason) = self.rejection_reason(&source, &target_database) {
            return self.reject(&source, reason).await;
        }

        let handle = match self.ctx.registry.register_incoming(source.clone()) {
            Ok(handle) => handle,
            Err(ReplicationError::ShuttingDown) => {
                self.send_refusal("database is shutting down").await;
                return Err(ReplicationError::ShuttingDown);
            }
            Err(e) => return Err(e),
        };

        let source_key = source.source_key();
        let last_accepted_etag = self.ctx.watermarks.incoming(&source_key).await;
        self.channel
            .send(ReplicationMessage::HandshakeAck {
                accepted: true,
                reason: None,
                last_accepted_etag,
            })
            .await?;
        self.ctx.registry.touch_incoming(&source);
        self.state.transition(HandlerState::Idle)?;
        info!(source = %source, connection = handle.id(), last_accepted_etag, "Incoming replication accepted");

        self.stream(&handle).await
    }

    async fn stream(&mut self, handle: &IncomingHandle) -> Result<()> {
        let peer = self.channel.peer().to_string();
        let superseded = handle.superseded();

        loop {
            let received = tokio::select! {
                biased;
                _ = wait_for_shutdown(self.ctx.shutdown_rx.clone()) => {
                    debug!("Shutdown requested, closing incoming connection");
                    return Ok(());
                }
                _ = wait_for_shutdown(superseded.clone()) => {
                    info!(connection = handle.id(), "Superseded by a newer connection from the same source");
                    return Ok(());
                }
                received = self.channel.receive() => received?,
            };

            let Some(message) = received else {
                debug!("Peer closed the connection");
                return Ok(());
            };
            self.ctx.registry.touch_incoming(handle.info());

            match message {
                ReplicationMessage::Batch(batch) => {
                    if !self.apply(handle, batch).await? {
                        return Ok(());
                    }
                }
                ReplicationMessage::Heartbeat => trace!("Heartbeat"),
                ReplicationMessage::Error { message } => {
                    return Err(ReplicationError::transport(&peer, format!("peer reported: {}", message)))
                }
                other => {
                    return Err(ReplicationError::protocol(
                        &peer,
                        format!("unexpected {} frame while streaming", other.kind()),
                    ))
                }
            }
        }
    }

    /// Apply one batch. Returns `false` when shutdown interrupted it before
    /// anything was written.
    async fn apply(&mut self, handle: &IncomingHandle, batch: ReplicationBatch) -> Result<bool> {
        let source = handle.info();
        self.state.transition(HandlerState::Streaming)?;
        let mut sample = SampleBuilder::start(Direction::Incoming, source.source_database_id.clone());

        batch.validate(self.channel.peer())?;
        sample.stage("validate");

        if let Some(limiter) = &self.ctx.rate_limiter {
            let permits = u32::try_from(batch.items.len()).unwrap_or(u32::MAX);
            tokio::select! {
                biased;
                _ = wait_for_shutdown(self.ctx.shutdown_rx.clone()) => {
                    debug!(items = batch.items.len(), "Shutdown while throttled, batch abandoned uncommitted");
                    return Ok(false);
                }
                _ = limiter.acquire_many(permits) => {}
            }
            sample.stage("throttle");
        }

        let applied = self.ctx.storage.apply_batch(&batch.items).await?;
        sample.stage("apply");

        self.ctx
            .watermarks
            .set_incoming(&source.source_key(), batch.last_etag)
            .await;
        self.channel
            .send(ReplicationMessage::BatchAck {
                last_etag: batch.last_etag,
            })
            .await?;
        sample.stage("ack");

        let tombstones = batch.tombstone_count();
        let documents = batch.items.len() - tombstones;
        sample.documents = documents;
        sample.tombstones = tombstones;
        sample.conflicts = applied.conflicts();
        sample.superseded = applied.superseded();

        metrics::record_batch_applied(&source.source_database_id, documents, tombstones, sample.elapsed());
        metrics::record_apply_outcomes(
            &source.source_database_id,
            applied.accepted(),
            applied.conflicts(),
            applied.superseded(),
        );
        debug!(
            items = batch.items.len(),
            last_etag = batch.last_etag,
            conflicts = applied.conflicts(),
            "Batch applied"
        );
        handle.recorder().record(sample.finish()).await;

        self.state.transition(HandlerState::Idle)?;
        Ok(true)
    }

    fn rejection_reason(&self, source: &IncomingConnectionInfo, target_database: &str) -> Option<String> {
        let local = &self.ctx.identity;
        if !target_database.eq_ignore_ascii_case(&local.source_database_name) {
            return Some(format!(
                "target database {} does not match {}",
                target_database, local.source_database_name
            ));
        }
        if source.source_key() == local.source_key() {
            return Some("a database cannot replicate to itself".to_string());
        }
        None
    }

    async fn reject(&mut self, source: &IncomingConnectionInfo, reason: String) -> Result<()> {
        self.ctx.registry.record_rejection(source, reason.clone());
        self.send_refusal(&reason).await;
        Err(ReplicationError::Rejected {
            source_id: source.source_database_id.clone(),
            reason,
        })
    }

    async fn send_refusal(&mut self, reason: &str) {
        let refusal = ReplicationMessage::HandshakeAck {
            accepted: false,
            reason: Some(reason.to_string()),
            last_accepted_etag: 0,
        };
        if let Err(e) = self.channel.send(refusal).await {
            debug!(error = %e, "Could not deliver handshake refusal");
        }
    }
}
