//! Write path: replicated batches, local writes and conflict resolution.
//!
//! # Incoming version vs. local state
//!
//! ```text
//! local state        incoming is            result
//! ───────────        ───────────            ──────
//! nothing            -                      Accepted
//! current version    Newer                  Accepted (replaces)
//! current version    Equal / Older          Superseded
//! current version    Concurrent             ConflictCreated (both moved to conflicts)
//! tombstone          Concurrent tombstone   Accepted (vectors merged)
//! conflicts          covered by any         Superseded
//! conflicts          Newer than all         Accepted (conflict collapses)
//! conflicts          otherwise              ConflictCreated (dominated versions dropped)
//! ```

use super::{codec_err, execute_with_retry, format_ts, version_from_row, ConflictsStorage, VersionRow};
use crate::change_vector::{Causality, ChangeVector};
use crate::document::{
    document_key, ConflictVersion, Metadata, ReplicatedDocument, ReplicationItem, Tombstone,
};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use chrono::Utc;
use sqlx::SqliteConnection;
use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

/// Result of applying one replicated document or tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Stored as the current version.
    Accepted,
    /// Stored alongside concurrent local versions.
    ConflictCreated,
    /// Already covered by local history; discarded.
    Superseded,
}

/// Outcome of a committed batch.
#[derive(Debug, Clone, Default)]
pub struct BatchApplied {
    /// One outcome per item, in batch order.
    pub outcomes: Vec<ApplyOutcome>,
    /// Highest local etag after commit.
    pub last_etag: u64,
}

impl BatchApplied {
    fn count(&self, outcome: ApplyOutcome) -> usize {
        self.outcomes.iter().filter(|o| **o == outcome).count()
    }

    pub fn accepted(&self) -> usize {
        self.count(ApplyOutcome::Accepted)
    }

    pub fn conflicts(&self) -> usize {
        self.count(ApplyOutcome::ConflictCreated)
    }

    pub fn superseded(&self) -> usize {
        self.count(ApplyOutcome::Superseded)
    }
}

type SqlResult<T> = std::result::Result<T, sqlx::Error>;

impl ConflictsStorage {
    /// Apply one replicated item in its own transaction.
    pub async fn apply_incoming(&self, item: ReplicationItem) -> Result<ApplyOutcome> {
        let applied = self.apply_batch(std::slice::from_ref(&item)).await?;
        applied
            .outcomes
            .first()
            .copied()
            .ok_or_else(|| ReplicationError::Internal("empty batch outcome".to_string()))
    }

    /// Apply a replicated batch atomically.
    ///
    /// Either every item is applied or, on error, none is.
    #[instrument(skip(self, items), fields(count = items.len()))]
    pub async fn apply_batch(&self, items: &[ReplicationItem]) -> Result<BatchApplied> {
        if items.is_empty() {
            return Ok(BatchApplied {
                outcomes: Vec::new(),
                last_etag: self.last_etag(),
            });
        }

        let keys: BTreeSet<String> = items.iter().map(|i| document_key(i.id())).collect();
        let _guards = self.locks.lock_many(keys).await;

        let applied = execute_with_retry("apply_batch", || self.apply_batch_once(items)).await?;
        self.publish_etag(applied.last_etag);

        let conflicts = applied.conflicts();
        metrics::record_conflicts_created(conflicts);
        if conflicts > 0 {
            info!(conflicts, "Replicated batch created conflicts");
        }
        debug!(
            accepted = applied.accepted(),
            superseded = applied.superseded(),
            last_etag = applied.last_etag,
            "Batch committed"
        );
        Ok(applied)
    }

    async fn apply_batch_once(&self, items: &[ReplicationItem]) -> SqlResult<BatchApplied> {
        let mut tx = self.pool.begin().await?;
        take_write_lock(&mut tx).await?;

        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            outcomes.push(apply_item(&mut tx, item).await?);
        }
        let last_etag = current_etag(&mut tx).await?;
        tx.commit().await?;

        Ok(BatchApplied { outcomes, last_etag })
    }

    /// Local write. A put on a conflicted document resolves the conflict.
    pub async fn put_document(
        &self,
        id: &str,
        collection: &str,
        body: serde_json::Value,
        metadata: Metadata,
    ) -> Result<ReplicatedDocument> {
        let key = document_key(id);
        let _guard = self.locks.lock(&key).await;

        let doc = execute_with_retry("put_document", || async {
            let mut tx = self.pool.begin().await?;
            take_write_lock(&mut tx).await?;

            let conflicts = load_conflicts(&mut tx, &key).await?;
            let mut vector = if conflicts.is_empty() {
                load_current(&mut tx, &key)
                    .await?
                    .map(|v| v.change_vector)
                    .unwrap_or_default()
            } else {
                delete_conflicts(&mut tx, &key).await?;
                ChangeVector::merged(conflicts.iter().map(|c| &c.change_vector))
            };

            let etag = next_etag(&mut tx).await?;
            vector.advance(&self.node_tag, etag);
            let doc = ReplicatedDocument {
                id: id.to_string(),
                collection: collection.to_string(),
                body: body.clone(),
                metadata: metadata.clone(),
                change_vector: vector,
                last_modified: Utc::now(),
                etag,
            };
            write_document(&mut tx, &key, &doc).await?;
            tx.commit().await?;
            Ok(doc)
        })
        .await?;

        self.publish_etag(doc.etag);
        Ok(doc)
    }

    /// Local delete. Returns `None` when there was nothing to delete.
    pub async fn delete_document(&self, id: &str) -> Result<Option<Tombstone>> {
        let key = document_key(id);
        let _guard = self.locks.lock(&key).await;

        let tombstone = execute_with_retry("delete_document", || async {
            let mut tx = self.pool.begin().await?;
            take_write_lock(&mut tx).await?;

            let conflicts = load_conflicts(&mut tx, &key).await?;
            let (mut vector, collection) = if !conflicts.is_empty() {
                delete_conflicts(&mut tx, &key).await?;
                let collection = conflicts.last().map(|c| c.collection.clone()).unwrap_or_default();
                (ChangeVector::merged(conflicts.iter().map(|c| &c.change_vector)), collection)
            } else {
                match load_current(&mut tx, &key).await? {
                    Some(current) if !current.is_deletion() => (current.change_vector, current.collection),
                    _ => return Ok(None),
                }
            };

            let etag = next_etag(&mut tx).await?;
            vector.advance(&self.node_tag, etag);
            let tombstone = Tombstone {
                id: id.to_string(),
                collection,
                change_vector: vector,
                deleted_at: Utc::now(),
                etag,
            };
            write_tombstone(&mut tx, &key, &tombstone).await?;
            tx.commit().await?;
            Ok(Some(tombstone))
        })
        .await?;

        if let Some(t) = &tombstone {
            self.publish_etag(t.etag);
        }
        Ok(tombstone)
    }

    /// Replace every competing version of `id` with one resolved document.
    ///
    /// The new change vector is the component-wise maximum of all competing
    /// vectors plus a local increment, so it dominates each of them.
    pub async fn resolve_conflict(
        &self,
        id: &str,
        body: serde_json::Value,
        metadata: Metadata,
    ) -> Result<ReplicatedDocument> {
        let key = document_key(id);
        let _guard = self.locks.lock(&key).await;

        let resolved = execute_with_retry("resolve_conflict", || async {
            let mut tx = self.pool.begin().await?;
            take_write_lock(&mut tx).await?;

            let conflicts = load_conflicts(&mut tx, &key).await?;
            let Some(latest) = conflicts.last() else {
                return Ok(None);
            };

            let mut vector = ChangeVector::merged(conflicts.iter().map(|c| &c.change_vector));
            let etag = next_etag(&mut tx).await?;
            vector.advance(&self.node_tag, etag);

            let doc = ReplicatedDocument {
                id: latest.id.clone(),
                collection: latest.collection.clone(),
                body: body.clone(),
                metadata: metadata.clone(),
                change_vector: vector,
                last_modified: Utc::now(),
                etag,
            };
            delete_conflicts(&mut tx, &key).await?;
            write_document(&mut tx, &key, &doc).await?;
            tx.commit().await?;
            Ok(Some(doc))
        })
        .await?;

        let doc = resolved.ok_or_else(|| ReplicationError::NotConflicted(id.to_string()))?;
        self.publish_etag(doc.etag);
        metrics::record_conflict_resolved();
        info!(doc_id = %id, etag = doc.etag, change_vector = %doc.change_vector, "Conflict resolved");
        Ok(doc)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Transaction steps
// ═══════════════════════════════════════════════════════════════════════════════

async fn apply_item(conn: &mut SqliteConnection, item: &ReplicationItem) -> SqlResult<ApplyOutcome> {
    let key = document_key(item.id());
    let incoming = item.change_vector();
    let conflicts = load_conflicts(conn, &key).await?;

    if !conflicts.is_empty() {
        if conflicts.iter().any(|c| incoming.compare(&c.change_vector).is_covered()) {
            return Ok(ApplyOutcome::Superseded);
        }

        let (dominated, concurrent): (Vec<&ConflictVersion>, Vec<&ConflictVersion>) = conflicts
            .iter()
            .partition(|c| c.change_vector.compare(incoming) == Causality::Older);

        if concurrent.is_empty() {
            delete_conflicts(conn, &key).await?;
            write_item(conn, &key, item, incoming.clone()).await?;
            return Ok(ApplyOutcome::Accepted);
        }

        for version in dominated {
            sqlx::query("DELETE FROM conflicts WHERE etag = ?")
                .bind(version.etag as i64)
                .execute(&mut *conn)
                .await?;
        }
        insert_conflict(conn, &key, &ConflictVersion::from(item)).await?;
        return Ok(ApplyOutcome::ConflictCreated);
    }

    let Some(local) = load_current(conn, &key).await? else {
        write_item(conn, &key, item, incoming.clone()).await?;
        return Ok(ApplyOutcome::Accepted);
    };

    match incoming.compare(&local.change_vector) {
        Causality::Newer => {
            write_item(conn, &key, item, incoming.clone()).await?;
            Ok(ApplyOutcome::Accepted)
        }
        Causality::Equal | Causality::Older => Ok(ApplyOutcome::Superseded),
        Causality::Concurrent if local.is_deletion() && item.is_tombstone() => {
            // Two deletions never conflict
            let merged = ChangeVector::merged([&local.change_vector, incoming]);
            write_item(conn, &key, item, merged).await?;
            Ok(ApplyOutcome::Accepted)
        }
        Causality::Concurrent => {
            delete_current(conn, &key).await?;
            insert_conflict(conn, &key, &local).await?;
            insert_conflict(conn, &key, &ConflictVersion::from(item)).await?;
            Ok(ApplyOutcome::ConflictCreated)
        }
    }
}

/// First statement of every write transaction: takes the database write lock.
async fn take_write_lock(conn: &mut SqliteConnection) -> SqlResult<()> {
    sqlx::query("UPDATE etag_sequence SET value = value WHERE id = 0")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn next_etag(conn: &mut SqliteConnection) -> SqlResult<u64> {
    let (value,): (i64,) =
        sqlx::query_as("UPDATE etag_sequence SET value = value + 1 WHERE id = 0 RETURNING value")
            .fetch_one(&mut *conn)
            .await?;
    Ok(value as u64)
}

async fn current_etag(conn: &mut SqliteConnection) -> SqlResult<u64> {
    let (value,): (i64,) = sqlx::query_as("SELECT value FROM etag_sequence WHERE id = 0")
        .fetch_one(&mut *conn)
        .await?;
    Ok(value as u64)
}

pub(super) async fn load_conflicts(conn: &mut SqliteConnection, key: &str) -> SqlResult<Vec<ConflictVersion>> {
    let rows: Vec<VersionRow> = sqlx::query_as(
        r#"
        SELECT doc_id, collection, change_vector, body, metadata, last_modified, etag
        FROM conflicts WHERE doc_key = ? ORDER BY etag
        "#,
    )
    .bind(key)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(version_from_row).collect()
}

/// Current document or tombstone for `key`.
pub(super) async fn load_current(conn: &mut SqliteConnection, key: &str) -> SqlResult<Option<ConflictVersion>> {
    let doc: Option<VersionRow> = sqlx::query_as(
        r#"
        SELECT doc_id, collection, change_vector, body, metadata, last_modified, etag
        FROM documents WHERE doc_key = ?
        "#,
    )
    .bind(key)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = doc {
        return version_from_row(row).map(Some);
    }

    let tombstone: Option<VersionRow> = sqlx::query_as(
        r#"
        SELECT doc_id, collection, change_vector, NULL, '{}', deleted_at, etag
        FROM tombstones WHERE doc_key = ?
        "#,
    )
    .bind(key)
    .fetch_optional(&mut *conn)
    .await?;
    tombstone.map(version_from_row).transpose()
}

async fn delete_conflicts(conn: &mut SqliteConnection, key: &str) -> SqlResult<()> {
    sqlx::query("DELETE FROM conflicts WHERE doc_key = ?")
        .bind(key)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn delete_current(conn: &mut SqliteConnection, key: &str) -> SqlResult<()> {
    sqlx::query("DELETE FROM documents WHERE doc_key = ?")
        .bind(key)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM tombstones WHERE doc_key = ?")
        .bind(key)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Store a conflict version under a freshly allocated etag.
async fn insert_conflict(conn: &mut SqliteConnection, key: &str, version: &ConflictVersion) -> SqlResult<()> {
    let etag = next_etag(conn).await?;
    let body = match &version.body {
        Some(body) => Some(serde_json::to_string(body).map_err(codec_err)?),
        None => None,
    };
    sqlx::query(
        r#"
        INSERT INTO conflicts (etag, doc_key, doc_id, collection, change_vector, body, metadata, last_modified)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(etag as i64)
    .bind(key)
    .bind(&version.id)
    .bind(&version.collection)
    .bind(serde_json::to_string(&version.change_vector).map_err(codec_err)?)
    .bind(body)
    .bind(serde_json::to_string(&version.metadata).map_err(codec_err)?)
    .bind(format_ts(&version.last_modified))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Store a replicated item as the current version with `vector`.
async fn write_item(
    conn: &mut SqliteConnection,
    key: &str,
    item: &ReplicationItem,
    vector: ChangeVector,
) -> SqlResult<()> {
    let etag = next_etag(conn).await?;
    match item {
        ReplicationItem::Document(d) => {
            let doc = ReplicatedDocument {
                change_vector: vector,
                etag,
                ..d.clone()
            };
            write_document(conn, key, &doc).await
        }
        ReplicationItem::Tombstone(t) => {
            let tombstone = Tombstone {
                change_vector: vector,
                etag,
                ..t.clone()
            };
            write_tombstone(conn, key, &tombstone).await
        }
    }
}

async fn write_document(conn: &mut SqliteConnection, key: &str, doc: &ReplicatedDocument) -> SqlResult<()> {
    sqlx::query("DELETE FROM tombstones WHERE doc_key = ?")
        .bind(key)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO documents
            (doc_key, doc_id, collection, change_vector, body, metadata, last_modified, etag)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(key)
    .bind(&doc.id)
    .bind(&doc.collection)
    .bind(serde_json::to_string(&doc.change_vector).map_err(codec_err)?)
    .bind(serde_json::to_string(&doc.body).map_err(codec_err)?)
    .bind(serde_json::to_string(&doc.metadata).map_err(codec_err)?)
    .bind(format_ts(&doc.last_modified))
    .bind(doc.etag as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_tombstone(conn: &mut SqliteConnection, key: &str, tombstone: &Tombstone) -> SqlResult<()> {
    sqlx::query("DELETE FROM documents WHERE doc_key = ?")
        .bind(key)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO tombstones (doc_key, doc_id, collection, change_vector, deleted_at, etag)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(key)
    .bind(&tombstone.id)
    .bind(&tombstone.collection)
    .bind(serde_json::to_string(&tombstone.change_vector).map_err(codec_err)?)
    .bind(format_ts(&tombstone.deleted_at))
    .bind(tombstone.etag as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::open_temp;
    use super::*;
    use serde_json::json;

    fn doc(id: &str, vector: &[(&str, u64)], body: serde_json::Value) -> ReplicationItem {
        ReplicationItem::Document(ReplicatedDocument {
            id: id.to_string(),
            collection: "Docs".to_string(),
            body,
            metadata: Metadata::new(),
            change_vector: vector.iter().map(|(n, c)| (*n, *c)).collect(),
            last_modified: Utc::now(),
            etag: 1,
        })
    }

    fn tombstone(id: &str, vector: &[(&str, u64)]) -> ReplicationItem {
        ReplicationItem::Tombstone(Tombstone {
            id: id.to_string(),
            collection: "Docs".to_string(),
            change_vector: vector.iter().map(|(n, c)| (*n, *c)).collect(),
            deleted_at: Utc::now(),
            etag: 1,
        })
    }

    #[tokio::test]
    async fn test_first_write_is_accepted() {
        let (storage, _dir) = open_temp("L").await;
        let outcome = storage.apply_incoming(doc("doc1", &[("node1", 1)], json!({"v": 1}))).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Accepted);

        let stored = storage.get_document("DOC1").await.unwrap().unwrap();
        assert_eq!(stored.body, json!({"v": 1}));
        assert_eq!(stored.etag, 1);
    }

    #[tokio::test]
    async fn test_failed_item_rolls_back_whole_batch() {
        let (storage, _dir) = open_temp("L").await;
        storage.apply_incoming(doc("shared", &[("node1", 1)], json!({"v": 1}))).await.unwrap();
        let before = storage.changes_since(0, 100).await.unwrap();
        assert_eq!(storage.last_etag(), 1);

        // Any write into conflicts now fails inside the transaction.
        sqlx::query(
            "CREATE TRIGGER reject_conflicts BEFORE INSERT ON conflicts \
             BEGIN SELECT RAISE(ABORT, 'conflicts unavailable'); END",
        )
        .execute(&storage.pool)
        .await
        .unwrap();

        let batch = vec![
            doc("fresh", &[("node2", 1)], json!({"v": 2})),
            doc("shared", &[("node2", 2)], json!({"v": 3})),
        ];
        assert!(storage.apply_batch(&batch).await.is_err());

        assert_eq!(storage.last_etag(), 1);
        assert!(storage.get_document("fresh").await.unwrap().is_none());
        assert_eq!(storage.get_document("shared").await.unwrap().unwrap().body, json!({"v": 1}));
        assert!(storage.get_conflicts_for("shared").await.unwrap().is_empty());
        assert_eq!(storage.changes_since(0, 100).await.unwrap(), before);

        sqlx::query("DROP TRIGGER reject_conflicts").execute(&storage.pool).await.unwrap();
        let applied = storage.apply_batch(&batch).await.unwrap();
        assert_eq!(applied.outcomes, vec![ApplyOutcome::Accepted, ApplyOutcome::ConflictCreated]);
    }

    #[tokio::test]
    async fn test_replay_is_superseded() {
        let (storage, _dir) = open_temp("L").await;
        let item = doc("doc1", &[("node1", 1)], json!({"v": 1}));
        storage.apply_incoming(item.clone()).await.unwrap();
        assert_eq!(storage.apply_incoming(item).await.unwrap(), ApplyOutcome::Superseded);
        assert_eq!(storage.last_etag(), 1);
    }

    #[tokio::test]
    async fn test_newer_replaces_older() {
        let (storage, _dir) = open_temp("L").await;
        storage.apply_incoming(doc("doc1", &[("node1", 1)], json!({"v": 1}))).await.unwrap();
        let outcome = storage
            .apply_incoming(doc("doc1", &[("node1", 2)], json!({"v": 2})))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Accepted);
        assert_eq!(storage.get_document("doc1").await.unwrap().unwrap().body, json!({"v": 2}));
        assert!(storage.get_conflicts_for("doc1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_creates_conflict() {
        let (storage, _dir) = open_temp("L").await;
        storage.apply_incoming(doc("doc1", &[("node1", 1)], json!({"a": 1}))).await.unwrap();
        let outcome = storage
            .apply_incoming(doc("doc1", &[("node2", 1)], json!({"b": 1})))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::ConflictCreated);

        let versions = storage.get_conflicts_for("doc1").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert!(storage.get_document("doc1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_third_concurrent_version_joins_conflict() {
        let (storage, _dir) = open_temp("L").await;
        storage.apply_incoming(doc("doc1", &[("node1", 1)], json!(1))).await.unwrap();
        storage.apply_incoming(doc("doc1", &[("node2", 1)], json!(2))).await.unwrap();
        let outcome = storage.apply_incoming(doc("doc1", &[("node3", 1)], json!(3))).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::ConflictCreated);
        assert_eq!(storage.get_conflicts_for("doc1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_partial_domination_drops_dominated_versions() {
        let (storage, _dir) = open_temp("L").await;
        storage.apply_incoming(doc("doc1", &[("node1", 1)], json!(1))).await.unwrap();
        storage.apply_incoming(doc("doc1", &[("node2", 1)], json!(2))).await.unwrap();
        // Dominates node1:1 but not node2:1
        let outcome = storage
            .apply_incoming(doc("doc1", &[("node1", 2), ("node3", 1)], json!(3)))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::ConflictCreated);

        let versions = storage.get_conflicts_for("doc1").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions.iter().all(|v| v.body != Some(json!(1))));
    }

    #[tokio::test]
    async fn test_dominating_write_collapses_conflict() {
        let (storage, _dir) = open_temp("L").await;
        storage.apply_incoming(doc("doc1", &[("node1", 1)], json!(1))).await.unwrap();
        storage.apply_incoming(doc("doc1", &[("node2", 1)], json!(2))).await.unwrap();
        let outcome = storage
            .apply_incoming(doc("doc1", &[("node1", 1), ("node2", 2)], json!(3)))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Accepted);
        assert!(storage.get_conflicts_for("doc1").await.unwrap().is_empty());
        assert_eq!(storage.get_document("doc1").await.unwrap().unwrap().body, json!(3));
    }

    #[tokio::test]
    async fn test_concurrent_delete_conflicts_with_document() {
        let (storage, _dir) = open_temp("L").await;
        storage.apply_incoming(doc("doc1", &[("node1", 1)], json!(1))).await.unwrap();
        let outcome = storage.apply_incoming(tombstone("doc1", &[("node2", 1)])).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::ConflictCreated);

        let versions = storage.get_conflicts_for("doc1").await.unwrap();
        assert_eq!(versions.iter().filter(|v| v.is_deletion()).count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_deletes_merge() {
        let (storage, _dir) = open_temp("L").await;
        storage.apply_incoming(tombstone("doc1", &[("node1", 1)])).await.unwrap();
        let outcome = storage.apply_incoming(tombstone("doc1", &[("node2", 1)])).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Accepted);

        let tombstones = storage.tombstones_from(None, 0, 10).await.unwrap();
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].change_vector.get("node1"), 1);
        assert_eq!(tombstones[0].change_vector.get("node2"), 1);
    }

    #[tokio::test]
    async fn test_resolve_then_replay_is_superseded() {
        let (storage, _dir) = open_temp("L").await;
        let a = doc("doc1", &[("node1", 1)], json!({"a": 1}));
        let b = doc("doc1", &[("node2", 1)], json!({"b": 1}));
        storage.apply_incoming(a.clone()).await.unwrap();
        storage.apply_incoming(b.clone()).await.unwrap();

        let resolved = storage
            .resolve_conflict("doc1", json!({"a": 1, "b": 1}), Metadata::new())
            .await
            .unwrap();
        assert_eq!(resolved.change_vector.get("node1"), 1);
        assert_eq!(resolved.change_vector.get("node2"), 1);
        assert_eq!(resolved.change_vector.get("L"), resolved.etag);
        assert!(storage.get_conflicts_for("doc1").await.unwrap().is_empty());

        assert_eq!(storage.apply_incoming(a).await.unwrap(), ApplyOutcome::Superseded);
        assert_eq!(storage.apply_incoming(b).await.unwrap(), ApplyOutcome::Superseded);
    }

    #[tokio::test]
    async fn test_resolve_without_conflict_fails() {
        let (storage, _dir) = open_temp("L").await;
        let err = storage.resolve_conflict("doc1", json!({}), Metadata::new()).await.unwrap_err();
        assert!(matches!(err, ReplicationError::NotConflicted(_)));
    }

    #[tokio::test]
    async fn test_local_put_advances_own_component() {
        let (storage, _dir) = open_temp("L").await;
        let first = storage.put_document("users/1", "Users", json!({"n": 1}), Metadata::new()).await.unwrap();
        let second = storage.put_document("users/1", "Users", json!({"n": 2}), Metadata::new()).await.unwrap();
        assert_eq!(second.change_vector.compare(&first.change_vector), Causality::Newer);
        assert_eq!(second.change_vector.get("L"), second.etag);
    }

    #[tokio::test]
    async fn test_local_put_resolves_conflict() {
        let (storage, _dir) = open_temp("L").await;
        storage.apply_incoming(doc("doc1", &[("node1", 1)], json!(1))).await.unwrap();
        storage.apply_incoming(doc("doc1", &[("node2", 1)], json!(2))).await.unwrap();
        let put = storage.put_document("doc1", "Docs", json!(3), Metadata::new()).await.unwrap();
        assert_eq!(put.change_vector.get("node1"), 1);
        assert_eq!(put.change_vector.get("node2"), 1);
        assert!(storage.get_conflicts_for("doc1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_delete_creates_tombstone() {
        let (storage, _dir) = open_temp("L").await;
        storage.put_document("users/1", "Users", json!({}), Metadata::new()).await.unwrap();
        let tombstone = storage.delete_document("Users/1").await.unwrap().unwrap();
        assert_eq!(tombstone.collection, "Users");
        assert!(storage.get_document("users/1").await.unwrap().is_none());

        // Deleting again is a no-op
        assert!(storage.delete_document("users/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_reports_outcomes_in_order() {
        let (storage, _dir) = open_temp("L").await;
        storage.apply_incoming(doc("doc1", &[("node1", 2)], json!(1))).await.unwrap();
        let batch = vec![
            doc("doc1", &[("node1", 1)], json!(0)),
            doc("doc2", &[("node1", 1)], json!(2)),
            doc("doc1", &[("node2", 1)], json!(3)),
        ];
        let applied = storage.apply_batch(&batch).await.unwrap();
        assert_eq!(
            applied.outcomes,
            vec![ApplyOutcome::Superseded, ApplyOutcome::Accepted, ApplyOutcome::ConflictCreated]
        );
        assert_eq!(applied.accepted(), 1);
        assert_eq!(applied.conflicts(), 1);
        assert_eq!(applied.superseded(), 1);
        assert_eq!(applied.last_etag, storage.last_etag());
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let (storage, _dir) = open_temp("L").await;
        let applied = storage.apply_batch(&[]).await.unwrap();
        assert!(applied.outcomes.is_empty());
        assert_eq!(applied.last_etag, 0);
    }

    #[tokio::test]
    async fn test_changes_notification() {
        let (storage, _dir) = open_temp("L").await;
        let mut rx = storage.subscribe_changes();
        storage.apply_incoming(doc("doc1", &[("node1", 1)], json!(1))).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
    }
}
