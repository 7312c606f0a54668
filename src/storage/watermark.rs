// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication watermarks.
//!
//! Two kinds of position are tracked, both as local etags:
//!
//! - **outgoing**: per destination, the highest etag the destination has
//!   acknowledged. The outgoing handler resumes from here.
//! - **incoming**: per source database, the highest etag (in the source's
//!   numbering) applied locally. Returned in the handshake ack so the
//!   source can skip what is already here.
//!
//! # Debounced Writes
//!
//! `set_*()` updates the in-memory cache immediately and marks the key dirty;
//! `flush_dirty()` persists dirty keys in one pass. The engine flushes on a
//! timer and on shutdown. A crash in between loses at most one flush
//! interval of progress, which only causes already-applied items to be sent
//! again and resolve to `Superseded`.
//!
//! Watermarks never move backwards.

use super::execute_with_retry;
use crate::document::ReplicationDestination;
use crate::error::{ReplicationError, Result};
use sqlx::sqlite::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const OUTGOING_PREFIX: &str = "outgoing/";
const INCOMING_PREFIX: &str = "incoming/";

fn outgoing_key(destination: &ReplicationDestination) -> String {
    format!(
        "{}{}@{}",
        OUTGOING_PREFIX,
        destination.database.to_lowercase(),
        destination.url.to_lowercase()
    )
}

fn incoming_key(source_key: &str) -> String {
    format!("{}{}", INCOMING_PREFIX, source_key.to_lowercase())
}

/// Persistent per-peer etag positions with debounced writes.
#[derive(Clone)]
pub struct WatermarkStore {
    pool: SqlitePool,
    cache: Arc<RwLock<HashMap<String, u64>>>,
    dirty: Arc<RwLock<HashSet<String>>>,
}

impl WatermarkStore {
    /// Create the table if needed and load every stored watermark.
    pub(crate) async fn load(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watermarks (
                peer_key TEXT PRIMARY KEY,
                etag INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT peer_key, etag FROM watermarks")
            .fetch_all(&pool)
            .await?;

        let mut cache = HashMap::new();
        for (peer_key, etag) in rows {
            debug!(peer_key = %peer_key, etag, "Loaded watermark from disk");
            cache.insert(peer_key, etag as u64);
        }
        if !cache.is_empty() {
            info!(count = cache.len(), "Restored watermarks from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
        })
    }

    /// Last etag acknowledged by `destination`, 0 if never.
    pub async fn outgoing(&self, destination: &ReplicationDestination) -> u64 {
        self.get(&outgoing_key(destination)).await
    }

    pub async fn set_outgoing(&self, destination: &ReplicationDestination, etag: u64) {
        self.set(outgoing_key(destination), etag).await;
    }

    /// Last source etag applied from `source_key`, 0 if never.
    pub async fn incoming(&self, source_key: &str) -> u64 {
        self.get(&incoming_key(source_key)).await
    }

    pub async fn set_incoming(&self, source_key: &str, etag: u64) {
        self.set(incoming_key(source_key), etag).await;
    }

    async fn get(&self, key: &str) -> u64 {
        self.cache.read().await.get(key).copied().unwrap_or(0)
    }

    async fn set(&self, key: String, etag: u64) {
        {
            let mut cache = self.cache.write().await;
            let current = cache.entry(key.clone()).or_insert(0);
            if etag <= *current {
                return;
            }
            *current = etag;
        }
        debug!(peer_key = %key, etag, "Watermark updated (pending flush)");
        self.dirty.write().await.insert(key);
    }

    /// Persist every dirty watermark. Returns the number written.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty_keys: Vec<String> = self.dirty.write().await.drain().collect();
        if dirty_keys.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let snapshot: Vec<(String, u64)> = {
            let cache = self.cache.read().await;
            dirty_keys
                .iter()
                .filter_map(|k| cache.get(k).map(|etag| (k.clone(), *etag)))
                .collect()
        };

        let pool = &self.pool;
        let mut flushed = 0;
        let mut errors = 0;

        for (peer_key, etag) in &snapshot {
            let result = execute_with_retry("watermark_flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO watermarks (peer_key, etag, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(peer_key) DO UPDATE SET
                        etag = MAX(watermarks.etag, excluded.etag),
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(peer_key)
                .bind(*etag as i64)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(peer_key = %peer_key, error = %e, "Failed to flush watermark");
                    self.dirty.write().await.insert(peer_key.clone());
                }
            }
        }

        if flushed > 0 || errors > 0 {
            debug!(flushed, errors, "Flushed dirty watermarks");
            crate::metrics::record_watermark_flush(flushed, errors);
        }

        if errors > 0 {
            return Err(ReplicationError::Internal(format!(
                "Failed to flush {} watermarks",
                errors
            )));
        }
        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    /// Every cached watermark (for debugging).
    pub async fn get_all(&self) -> HashMap<String, u64> {
        self.cache.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::open_temp;
    use super::super::ConflictsStorage;
    use super::*;
    use crate::config::StorageConfig;
    use tempfile::tempdir;

    fn dest() -> ReplicationDestination {
        ReplicationDestination::new("http://b:8080", "orders")
    }

    #[tokio::test]
    async fn test_unknown_peer_starts_at_zero() {
        let (storage, _dir) = open_temp("A").await;
        let marks = storage.watermarks().await.unwrap();
        assert_eq!(marks.outgoing(&dest()).await, 0);
        assert_eq!(marks.incoming("db-b").await, 0);
        assert!(!marks.has_dirty().await);
    }

    #[tokio::test]
    async fn test_set_marks_dirty_and_flushes_once() {
        let (storage, _dir) = open_temp("A").await;
        let marks = storage.watermarks().await.unwrap();

        marks.set_outgoing(&dest(), 10).await;
        marks.set_outgoing(&dest(), 20).await;
        assert_eq!(marks.outgoing(&dest()).await, 20);
        assert!(marks.has_dirty().await);

        assert_eq!(marks.flush_dirty().await.unwrap(), 1);
        assert!(!marks.has_dirty().await);
        assert_eq!(marks.flush_dirty().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_watermark_never_moves_backwards() {
        let (storage, _dir) = open_temp("A").await;
        let marks = storage.watermarks().await.unwrap();
        marks.set_incoming("db-b", 50).await;
        marks.flush_dirty().await.unwrap();

        marks.set_incoming("db-b", 40).await;
        assert_eq!(marks.incoming("db-b").await, 50);
        assert!(!marks.has_dirty().await);
    }

    #[tokio::test]
    async fn test_destination_identity_is_case_insensitive() {
        let (storage, _dir) = open_temp("A").await;
        let marks = storage.watermarks().await.unwrap();
        marks.set_outgoing(&dest(), 7).await;
        let same = ReplicationDestination::new("HTTP://B:8080", "Orders");
        assert_eq!(marks.outgoing(&same).await, 7);
    }

    #[tokio::test]
    async fn test_watermarks_survive_reopen() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::at(dir.path().join("marks.db"));
        {
            let storage = ConflictsStorage::open(&config, "A").await.unwrap();
            let marks = storage.watermarks().await.unwrap();
            marks.set_outgoing(&dest(), 99).await;
            marks.set_incoming("db-c", 12).await;
            assert_eq!(marks.flush_dirty().await.unwrap(), 2);
            storage.close().await;
        }
        let storage = ConflictsStorage::open(&config, "A").await.unwrap();
        let marks = storage.watermarks().await.unwrap();
        assert_eq!(marks.outgoing(&dest()).await, 99);
        assert_eq!(marks.incoming("db-c").await, 12);
        assert_eq!(marks.get_all().await.len(), 2);
    }
}
