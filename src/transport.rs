// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication transport.
//!
//! Handlers talk to peers through [`ReplicationChannel`], a message-level
//! abstraction over whatever carries the bytes. Outgoing handlers obtain
//! channels from a [`Connector`]; incoming channels are handed to
//! [`ReplicationEngine::accept_incoming`](crate::ReplicationEngine::accept_incoming)
//! by the embedding server.
//!
//! # Conversation
//!
//! ```text
//! outgoing (source)                       incoming (target)
//!   Handshake{source, target_database} ─▶
//!                                       ◀─ HandshakeAck{accepted, last_accepted_etag}
//!   Batch{items, last_etag, checksum}  ─▶
//!                                       ◀─ BatchAck{last_etag}
//!   Heartbeat (when idle)              ─▶
//! ```
//!
//! Two implementations are provided:
//!
//! - [`MemoryChannel`] / [`MemoryNetwork`]: in-process pairs over tokio mpsc
//! - [`StreamChannel`]: length-prefixed JSON frames over any
//!   `AsyncRead + AsyncWrite` byte stream (TCP, duplex, TLS)
//!
//! # Batch Integrity
//!
//! Each batch carries the SHA256 of its serialized items. The receiver
//! recomputes it before touching storage; a mismatch is a protocol violation.

use crate::document::{IncomingConnectionInfo, ReplicationDestination, ReplicationItem};
use crate::error::{ReplicationError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::ErrorKind;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Largest frame a [`StreamChannel`] accepts.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A batch of documents and tombstones in etag order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationBatch {
    pub items: Vec<ReplicationItem>,
    /// Sender etag of the last item.
    pub last_etag: u64,
    /// Hex SHA256 of the serialized items.
    pub checksum: String,
}

impl ReplicationBatch {
    pub fn new(items: Vec<ReplicationItem>) -> Result<Self> {
        let last_etag = items.iter().map(|i| i.etag()).max().unwrap_or(0);
        let checksum = Self::checksum_of(&items)?;
        Ok(Self {
            items,
            last_etag,
            checksum,
        })
    }

    pub fn checksum_of(items: &[ReplicationItem]) -> Result<String> {
        use sha2::{Digest, Sha256};
        let bytes = serde_json::to_vec(items)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Reject batches that must not reach storage.
    pub fn validate(&self, peer: &str) -> Result<()> {
        if self.items.is_empty() {
            return Err(ReplicationError::protocol(peer, "empty batch"));
        }
        if Self::checksum_of(&self.items)? != self.checksum {
            return Err(ReplicationError::protocol(peer, "batch checksum mismatch"));
        }
        for item in &self.items {
            if item.id().is_empty() {
                return Err(ReplicationError::protocol(peer, "item without document id"));
            }
            if item.change_vector().is_empty() {
                return Err(ReplicationError::protocol(
                    peer,
                    format!("item {} has an empty change vector", item.id()),
                ));
            }
        }
        let max_etag = self.items.iter().map(|i| i.etag()).max().unwrap_or(0);
        if max_etag != self.last_etag {
            return Err(ReplicationError::protocol(
                peer,
                format!("last_etag {} does not match items (max {})", self.last_etag, max_etag),
            ));
        }
        Ok(())
    }

    pub fn tombstone_count(&self) -> usize {
        self.items.iter().filter(|i| i.is_tombstone()).count()
    }
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicationMessage {
    Handshake {
        source: IncomingConnectionInfo,
        target_database: String,
    },
    HandshakeAck {
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Highest sender etag the receiver has applied from this source.
        last_accepted_etag: u64,
    },
    Batch(ReplicationBatch),
    BatchAck {
        last_etag: u64,
    },
    Heartbeat,
    Error {
        message: String,
    },
}

impl ReplicationMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicationMessage::Handshake { .. } => "handshake",
            ReplicationMessage::HandshakeAck { .. } => "handshake_ack",
            ReplicationMessage::Batch(_) => "batch",
            ReplicationMessage::BatchAck { .. } => "batch_ack",
            ReplicationMessage::Heartbeat => "heartbeat",
            ReplicationMessage::Error { .. } => "error",
        }
    }
}

/// Bidirectional message channel to one peer.
///
/// `receive` must be cancel-safe at message boundaries: handlers race it
/// against shutdown.
pub trait ReplicationChannel: Send + 'static {
    /// Human-readable peer address for logs and errors.
    fn peer(&self) -> &str;

    fn send(&mut self, message: ReplicationMessage) -> BoxFuture<'_, ()>;

    /// Next message, or `None` once the peer closed the channel.
    fn receive(&mut self) -> BoxFuture<'_, Option<ReplicationMessage>>;

    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Opens channels to destinations.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, destination: &'a ReplicationDestination) -> BoxFuture<'a, Box<dyn ReplicationChannel>>;
}

// =============================================================================
// In-memory channels
// =============================================================================

/// One end of an in-process channel pair.
pub struct MemoryChannel {
    peer: String,
    tx: Option<mpsc::Sender<ReplicationMessage>>,
    rx: mpsc::Receiver<ReplicationMessage>,
}

impl MemoryChannel {
    /// Connected pair; `capacity` frames may be in flight each way.
    pub fn pair(a: impl Into<String>, b: impl Into<String>, capacity: usize) -> (MemoryChannel, MemoryChannel) {
        let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
        let (b_tx, a_rx) = mpsc::channel(capacity.max(1));
        (
            MemoryChannel {
                peer: b.into(),
                tx: Some(a_tx),
                rx: a_rx,
            },
            MemoryChannel {
                peer: a.into(),
                tx: Some(b_tx),
                rx: b_rx,
            },
        )
    }
}

impl ReplicationChannel for MemoryChannel {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn send(&mut self, message: ReplicationMessage) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let tx = self
                .tx
                .as_ref()
                .ok_or_else(|| ReplicationError::transport(&self.peer, "channel closed locally"))?;
            tx.send(message)
                .await
                .map_err(|_| ReplicationError::transport(&self.peer, "peer closed the channel"))
        })
    }

    fn receive(&mut self) -> BoxFuture<'_, Option<ReplicationMessage>> {
        Box::pin(async move { Ok(self.rx.recv().await) })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.tx.take();
            self.rx.close();
            Ok(())
        })
    }
}

fn endpoint_key(url: &str, database: &str) -> String {
    format!("{}@{}", database.to_lowercase(), url.to_lowercase())
}

/// In-process "network": listeners keyed by `(url, database)`.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<String, mpsc::UnboundedSender<MemoryChannel>>>,
    capacity: usize,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            capacity: 16,
        }
    }

    /// Accept connections addressed to `(url, database)`.
    /// Dropping the receiver makes the endpoint refuse connections.
    pub fn listen(&self, url: &str, database: &str) -> mpsc::UnboundedReceiver<MemoryChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(endpoint_key(url, database), tx);
        rx
    }

    /// Stop accepting connections for `(url, database)`.
    pub fn unlisten(&self, url: &str, database: &str) {
        self.listeners.remove(&endpoint_key(url, database));
    }

    /// Connector whose channels identify the local side as `local_name`.
    pub fn connector(&self, local_name: impl Into<String>) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
            local_name: local_name.into(),
        }
    }
}

/// [`Connector`] over a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryConnector {
    network: MemoryNetwork,
    local_name: String,
}

impl Connector for MemoryConnector {
    fn connect<'a>(&'a self, destination: &'a ReplicationDestination) -> BoxFuture<'a, Box<dyn ReplicationChannel>> {
        Box::pin(async move {
            let key = endpoint_key(&destination.url, &destination.database);
            let listener = self
                .network
                .listeners
                .get(&key)
                .map(|l| l.value().clone())
                .ok_or_else(|| ReplicationError::transport(destination.to_string(), "connection refused"))?;

            let capacity = self.network.capacity.max(1);
            let (client, server) = MemoryChannel::pair(self.local_name.clone(), destination.to_string(), capacity);
            listener
                .send(server)
                .map_err(|_| ReplicationError::transport(destination.to_string(), "connection refused"))?;
            debug!(destination = %destination, "In-memory connection established");
            Ok(Box::new(client) as Box<dyn ReplicationChannel>)
        })
    }
}

// =============================================================================
// Byte-stream channels
// =============================================================================

/// Serialize one frame: big-endian `u32` length, then JSON.
pub fn encode_frame(message: &ReplicationMessage) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_BYTES)
        .ok_or_else(|| ReplicationError::Internal(format!("frame of {} bytes too large", body.len())))?;
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parse one complete frame produced by [`encode_frame`].
pub fn decode_frame(peer: &str, frame: &[u8]) -> Result<ReplicationMessage> {
    if frame.len() < 4 {
        return Err(ReplicationError::protocol(peer, "truncated frame header"));
    }
    let (header, body) = frame.split_at(4);
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if len > MAX_FRAME_BYTES {
        return Err(ReplicationError::protocol(peer, format!("frame of {} bytes exceeds limit", len)));
    }
    if body.len() != len as usize {
        return Err(ReplicationError::protocol(
            peer,
            format!("frame length {} does not match body of {} bytes", len, body.len()),
        ));
    }
    decode_body(peer, body)
}

fn decode_body(peer: &str, body: &[u8]) -> Result<ReplicationMessage> {
    serde_json::from_slice(body)
        .map_err(|e| ReplicationError::protocol(peer, format!("undecodable frame: {}", e)))
}

/// Length-prefixed JSON frames over a byte stream.
pub struct StreamChannel<S> {
    peer: String,
    stream: S,
    closed: bool,
}

impl<S> StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(peer: impl Into<String>, stream: S) -> Self {
        Self {
            peer: peer.into(),
            stream,
            closed: false,
        }
    }
}

impl<S> ReplicationChannel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn peer(&self) -> &str {
        &self.peer
    }

    fn send(&mut self, message: ReplicationMessage) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed {
                return Err(ReplicationError::transport(&self.peer, "channel closed locally"));
            }
            let frame = encode_frame(&message)?;
            trace!(peer = %self.peer, kind = message.kind(), bytes = frame.len(), "Sending frame");
            self.stream
                .write_all(&frame)
                .await
                .map_err(|e| ReplicationError::transport(&self.peer, e.to_string()))?;
            self.stream
                .flush()
                .await
                .map_err(|e| ReplicationError::transport(&self.peer, e.to_string()))
        })
    }

    fn receive(&mut self) -> BoxFuture<'_, Option<ReplicationMessage>> {
        Box::pin(async move {
            if self.closed {
                return Ok(None);
            }
            let len = match self.stream.read_u32().await {
                Ok(len) => len,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(ReplicationError::transport(&self.peer, e.to_string())),
            };
            if len > MAX_FRAME_BYTES {
                return Err(ReplicationError::protocol(
                    &self.peer,
                    format!("frame of {} bytes exceeds limit", len),
                ));
            }
            let mut body = vec![0u8; len as usize];
            self.stream
                .read_exact(&mut body)
                .await
                .map_err(|e| ReplicationError::transport(&self.peer, e.to_string()))?;
            decode_body(&self.peer, &body).map(Some)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed {
                self.closed = true;
                self.stream
                    .shutdown()
                    .await
                    .map_err(|e| ReplicationError::transport(&self.peer, e.to_string()))?;
            }
            Ok(())
        })
    }
}
