// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conflict-aware document storage.
//!
//! [`ConflictsStorage`] keeps the current version of every document, the
//! tombstones of deleted documents and the set of unresolved conflicting
//! versions, all in one SQLite database and all numbered from a single etag
//! sequence:
//!
//! ```text
//! etag_sequence ── next etag ──┬── documents   (doc_key → current version)
//!                              ├── tombstones  (doc_key → deletion marker)
//!                              └── conflicts   (etag → competing version)
//! ```
//!
//! A document key lives in exactly one of: `documents`, `tombstones`, or
//! `conflicts` (two or more rows).
//!
//! # Transactions
//!
//! Every write runs in one SQLite transaction whose first statement takes the
//! database write lock. Etags are therefore allocated in commit order, and a
//! reader that has seen etag `N` will never later observe a commit below `N`.
//! A replicated batch commits as a whole or not at all.
//!
//! # Per-document serialization
//!
//! Writes to the same document id (replication, resolution, local put and
//! delete) take a per-id async lock before opening their transaction.
//! Unrelated ids do not wait on each other.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff. Retries
//! re-run the whole transaction.

mod apply;
mod locks;
mod queries;
mod watermark;

pub use apply::{ApplyOutcome, BatchApplied};
pub use queries::{ConflictSummary, ConflictsPage};
pub use watermark::WatermarkStore;

use crate::config::StorageConfig;
use crate::document::{ConflictVersion, Metadata};
use crate::error::{is_busy, ReplicationError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use locks::DocumentLocks;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_busy(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::storage_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_busy(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS etag_sequence (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        value INTEGER NOT NULL
    )
    "#,
    "INSERT OR IGNORE INTO etag_sequence (id, value) VALUES (0, 0)",
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        doc_key TEXT PRIMARY KEY,
        doc_id TEXT NOT NULL,
        collection TEXT NOT NULL,
        change_vector TEXT NOT NULL,
        body TEXT NOT NULL,
        metadata TEXT NOT NULL,
        last_modified TEXT NOT NULL,
        etag INTEGER NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tombstones (
        doc_key TEXT PRIMARY KEY,
        doc_id TEXT NOT NULL,
        collection TEXT NOT NULL,
        change_vector TEXT NOT NULL,
        deleted_at TEXT NOT NULL,
        etag INTEGER NOT NULL UNIQUE
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tombstones_collection ON tombstones (collection, etag)",
    r#"
    CREATE TABLE IF NOT EXISTS conflicts (
        etag INTEGER PRIMARY KEY,
        doc_key TEXT NOT NULL,
        doc_id TEXT NOT NULL,
        collection TEXT NOT NULL,
        change_vector TEXT NOT NULL,
        body TEXT,
        metadata TEXT NOT NULL,
        last_modified TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_conflicts_doc ON conflicts (doc_key, etag)",
];

/// Durable store of documents, tombstones and unresolved conflicts.
pub struct ConflictsStorage {
    pool: SqlitePool,
    /// Local node tag, bumped on local writes and resolutions.
    node_tag: String,
    locks: DocumentLocks,
    /// Last committed etag, for waking idle outgoing handlers.
    changes_tx: watch::Sender<u64>,
    path: String,
}

impl ConflictsStorage {
    /// Open (or create) the store described by `config`.
    pub async fn open(config: &StorageConfig, node_tag: impl Into<String>) -> Result<Self> {
        let path = config.sqlite_path.clone();
        info!(path = %path, "Opening conflicts storage");

        let (options, pool_options) = if config.is_in_memory() {
            // One connection that never idles out: the database lives in it
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?;
            let pool_options = SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
            (options, pool_options)
        } else {
            let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
                .journal_mode(SqliteJournalMode::Wal)
                .create_if_missing(true);
            let pool_options = SqlitePoolOptions::new().max_connections(config.max_connections.max(1));
            (options, pool_options)
        };

        let options = options
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        let pool = pool_options.connect_with(options).await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        let (last_etag,): (i64,) = sqlx::query_as("SELECT value FROM etag_sequence WHERE id = 0")
            .fetch_one(&pool)
            .await?;
        let (changes_tx, _) = watch::channel(last_etag as u64);

        info!(path = %path, last_etag, "Conflicts storage ready");

        Ok(Self {
            pool,
            node_tag: node_tag.into(),
            locks: DocumentLocks::new(),
            changes_tx,
            path,
        })
    }

    /// Local node tag used for change-vector increments.
    pub fn node_tag(&self) -> &str {
        &self.node_tag
    }

    /// Database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Subscribe to the last committed etag.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes_tx.subscribe()
    }

    /// Last etag handed out.
    pub fn last_etag(&self) -> u64 {
        *self.changes_tx.borrow()
    }

    /// Open a watermark store on the same database.
    pub async fn watermarks(&self) -> Result<WatermarkStore> {
        WatermarkStore::load(self.pool.clone()).await
    }

    pub(crate) fn publish_etag(&self, etag: u64) {
        self.changes_tx.send_if_modified(|current| {
            if etag > *current {
                *current = etag;
                true
            } else {
                false
            }
        });
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("storage_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!(path = %self.path, "Conflicts storage closed");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row codecs
// ═══════════════════════════════════════════════════════════════════════════════

/// `(doc_id, collection, change_vector, body, metadata, last_modified, etag)`
pub(crate) type VersionRow = (String, String, String, Option<String>, String, String, i64);

pub(crate) fn codec_err(e: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(e))
}

pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(raw: &str) -> std::result::Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(codec_err)
}

pub(crate) fn version_from_row(row: VersionRow) -> std::result::Result<ConflictVersion, sqlx::Error> {
    let (id, collection, change_vector, body, metadata, last_modified, etag) = row;
    let body = match body {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(codec_err)?),
        None => None,
    };
    let metadata: Metadata = serde_json::from_str(&metadata).map_err(codec_err)?;
    Ok(ConflictVersion {
        id,
        collection,
        change_vector: serde_json::from_str(&change_vector).map_err(codec_err)?,
        body,
        metadata,
        last_modified: parse_ts(&last_modified)?,
        etag: etag as u64,
    })
}
