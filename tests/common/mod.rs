//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Engine nodes over an in-process [`MemoryNetwork`]
//! - A listener task feeding accepted channels to an engine
//! - Polling helpers for eventually-consistent assertions

#![allow(dead_code)]

use doc_replication::{
    ConflictVersion, MemoryNetwork, ReplicatedDocument, ReplicationConfig, ReplicationDestination,
    ReplicationEngine, StorageConfig,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

pub const DATABASE: &str = "orders";
pub const WAIT: Duration = Duration::from_secs(5);

/// One engine plus the task accepting its inbound connections.
pub struct TestNode {
    pub engine: Arc<ReplicationEngine>,
    pub listener: JoinHandle<()>,
    pub dir: TempDir,
}

impl TestNode {
    pub fn url(&self) -> String {
        self.engine.config().url.clone()
    }

    /// Destination other nodes use to reach this one.
    pub fn destination(&self) -> ReplicationDestination {
        ReplicationDestination::new(self.url(), DATABASE)
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
        self.listener.abort();
    }
}

pub fn url_of(tag: &str) -> String {
    ReplicationConfig::for_testing(tag, DATABASE).url
}

pub fn destination_of(tag: &str) -> ReplicationDestination {
    ReplicationDestination::new(url_of(tag), DATABASE)
}

/// Config for `tag` with file-backed storage in `dir`.
pub fn config_in(dir: &TempDir, tag: &str, destinations: Vec<ReplicationDestination>) -> ReplicationConfig {
    let mut config = ReplicationConfig::for_testing(tag, DATABASE);
    config.storage = StorageConfig::at(dir.path().join(format!("{}.db", tag.to_lowercase())));
    config.storage.watermark_flush_interval = "50ms".to_string();
    config.destinations = destinations;
    config
}

/// Open, start and listen.
pub async fn start_node(network: &MemoryNetwork, tag: &str, destinations: Vec<ReplicationDestination>) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir, tag, destinations);
    start_with_config(network, config, dir).await
}

pub async fn start_with_config(network: &MemoryNetwork, config: ReplicationConfig, dir: TempDir) -> TestNode {
    let tag = config.node_tag.clone();
    let url = config.url.clone();
    let database = config.database_name.clone();
    let engine = Arc::new(
        ReplicationEngine::open(config, Arc::new(network.connector(tag)))
            .await
            .unwrap(),
    );
    engine.start().await.unwrap();
    let listener = spawn_listener(network, &url, &database, Arc::clone(&engine));
    TestNode { engine, listener, dir }
}

/// Route connections for `(url, database)` to `engine`.
pub fn spawn_listener(
    network: &MemoryNetwork,
    url: &str,
    database: &str,
    engine: Arc<ReplicationEngine>,
) -> JoinHandle<()> {
    let mut accepted = network.listen(url, database);
    tokio::spawn(async move {
        while let Some(channel) = accepted.recv().await {
            if engine.accept_incoming(Box::new(channel)).await.is_err() {
                break;
            }
        }
    })
}

/// Poll `check` until it yields `Some` or [`WAIT`] elapses.
pub async fn eventually<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_document(engine: &Arc<ReplicationEngine>, id: &str) -> ReplicatedDocument {
    let engine = Arc::clone(engine);
    let id = id.to_string();
    eventually("document", move || {
        let engine = Arc::clone(&engine);
        let id = id.clone();
        async move { engine.storage().get_document(&id).await.unwrap() }
    })
    .await
}

/// Wait until `id` has exactly `count` competing versions.
pub async fn wait_for_conflicts(engine: &Arc<ReplicationEngine>, id: &str, count: usize) -> Vec<ConflictVersion> {
    let engine = Arc::clone(engine);
    let id = id.to_string();
    eventually("conflict versions", move || {
        let engine = Arc::clone(&engine);
        let id = id.clone();
        async move {
            let versions = engine.storage().get_conflicts_for(&id).await.unwrap();
            (versions.len() == count).then_some(versions)
        }
    })
    .await
}

pub async fn wait_for_deletion(engine: &Arc<ReplicationEngine>, id: &str) {
    let engine = Arc::clone(engine);
    let id = id.to_string();
    eventually("tombstone", move || {
        let engine = Arc::clone(&engine);
        let id = id.clone();
        async move {
            let gone = engine.storage().get_document(&id).await.unwrap().is_none();
            let tombstone = engine.storage().get_tombstone(&id).await.unwrap();
            (gone && tombstone.is_some()).then_some(())
        }
    })
    .await
}
