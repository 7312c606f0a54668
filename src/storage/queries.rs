//! Read side of the conflicts storage: point lookups, etag-ordered scans and
//! the pages served to monitoring.
//!
//! Every scan is keyed by etag, so a caller can stop at any point and resume
//! later from the last etag it saw.

use super::apply::{load_conflicts, load_current};
use super::{parse_ts, version_from_row, ConflictsStorage, VersionRow};
use crate::document::{document_key, ConflictRecord, ReplicatedDocument, ReplicationItem, Tombstone};
use crate::error::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use std::collections::VecDeque;

/// One conflicted document in a [`ConflictsPage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConflictSummary {
    pub id: String,
    pub last_modified: DateTime<Utc>,
    /// Largest etag among the competing versions.
    pub etag: u64,
}

/// Conflicted documents, one entry per document id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConflictsPage {
    /// Distinct conflicted documents past the cursor, across all pages.
    pub total_results: u64,
    pub results: Vec<ConflictSummary>,
}

type TombstoneRow = (String, String, String, String, i64);

fn tombstone_from_row(row: TombstoneRow) -> std::result::Result<Tombstone, sqlx::Error> {
    let (id, collection, change_vector, deleted_at, etag) = row;
    Ok(Tombstone {
        id,
        collection,
        change_vector: serde_json::from_str(&change_vector).map_err(super::codec_err)?,
        deleted_at: parse_ts(&deleted_at)?,
        etag: etag as u64,
    })
}

struct ConflictScan {
    pool: SqlitePool,
    since: u64,
    page_size: u32,
    buffer: VecDeque<ConflictRecord>,
    exhausted: bool,
}

impl ConflictScan {
    /// Fill the buffer with the next page of distinct conflicted documents.
    async fn fill(&mut self) -> Result<()> {
        let keys: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT doc_key, MAX(etag) AS max_etag
            FROM conflicts
            WHERE etag > ?
            GROUP BY doc_key
            ORDER BY max_etag
            LIMIT ?
            "#,
        )
        .bind(self.since as i64)
        .bind(self.page_size as i64)
        .fetch_all(&self.pool)
        .await?;

        if keys.len() < self.page_size as usize {
            self.exhausted = true;
        }

        let mut conn = self.pool.acquire().await?;
        for (key, max_etag) in keys {
            self.since = max_etag as u64;
            let versions = load_conflicts(&mut conn, &key).await?;
            // Resolved between the two reads
            if versions.len() < 2 {
                continue;
            }
            let id = versions
                .last()
                .map(|v| v.id.clone())
                .unwrap_or_else(|| key.clone());
            self.buffer.push_back(ConflictRecord { id, versions });
        }
        Ok(())
    }

    async fn next_record(mut self) -> Result<Option<(ConflictRecord, ConflictScan)>> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Ok(Some((record, self)));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.fill().await?;
        }
    }
}

impl ConflictsStorage {
    /// Current (non-deleted, non-conflicted) version of a document.
    pub async fn get_document(&self, id: &str) -> Result<Option<ReplicatedDocument>> {
        let row: Option<VersionRow> = sqlx::query_as(
            r#"
            SELECT doc_id, collection, change_vector, body, metadata, last_modified, etag
            FROM documents WHERE doc_key = ?
            "#,
        )
        .bind(document_key(id))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        match version_from_row(row)?.to_item() {
            ReplicationItem::Document(doc) => Ok(Some(doc)),
            ReplicationItem::Tombstone(_) => Ok(None),
        }
    }

    pub async fn get_tombstone(&self, id: &str) -> Result<Option<Tombstone>> {
        let row: Option<TombstoneRow> = sqlx::query_as(
            r#"
            SELECT doc_id, collection, change_vector, deleted_at, etag
            FROM tombstones WHERE doc_key = ?
            "#,
        )
        .bind(document_key(id))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(tombstone_from_row).transpose()?)
    }

    /// All competing versions of one document, ordered by etag.
    /// Empty when the document is not in conflict.
    pub async fn get_conflicts_for(&self, id: &str) -> Result<Vec<crate::document::ConflictVersion>> {
        let mut conn = self.pool.acquire().await?;
        Ok(load_conflicts(&mut conn, &document_key(id)).await?)
    }

    /// Whether `id` currently has a stored version, deletion or conflict.
    pub async fn exists(&self, id: &str) -> Result<bool> {
        let key = document_key(id);
        let mut conn = self.pool.acquire().await?;
        if !load_conflicts(&mut conn, &key).await?.is_empty() {
            return Ok(true);
        }
        Ok(load_current(&mut conn, &key).await?.is_some())
    }

    /// Conflicted documents touched after `since`, ordered by their largest
    /// etag, one record per document.
    ///
    /// The stream reads `page_size` documents at a time and ends when the
    /// table is exhausted. To resume later, start a new scan from the
    /// [`largest_etag`](ConflictRecord::largest_etag) of the last record.
    pub fn conflicts_after(
        &self,
        since: u64,
        page_size: u32,
    ) -> impl Stream<Item = Result<ConflictRecord>> + Send + 'static {
        let scan = ConflictScan {
            pool: self.pool.clone(),
            since,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            exhausted: false,
        };

        stream::try_unfold(scan, ConflictScan::next_record)
    }

    /// One page of conflicted documents past `since`, skipping `start`.
    /// `total_results` counts every conflicted document.
    pub async fn conflicts_page(&self, since: u64, start: u32, page_size: u32) -> Result<ConflictsPage> {
        let total = self.conflicted_document_count().await?;

        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            r#"
            SELECT doc_id, MAX(etag) AS max_etag, MAX(last_modified)
            FROM conflicts
            WHERE etag > ?
            GROUP BY doc_key
            ORDER BY max_etag
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(since as i64)
        .bind(page_size as i64)
        .bind(start as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::with_capacity(rows.len());
        for (id, etag, last_modified) in rows {
            results.push(ConflictSummary {
                id,
                last_modified: parse_ts(&last_modified)?,
                etag: etag as u64,
            });
        }

        Ok(ConflictsPage {
            total_results: total,
            results,
        })
    }

    /// Number of documents currently in conflict.
    pub async fn conflicted_document_count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(DISTINCT doc_key) FROM conflicts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Tombstones with etag `>= from_etag`, optionally limited to one
    /// collection, in etag order.
    pub async fn tombstones_from(
        &self,
        collection: Option<&str>,
        from_etag: u64,
        page_size: u32,
    ) -> Result<Vec<Tombstone>> {
        let rows: Vec<TombstoneRow> = match collection {
            Some(collection) => {
                sqlx::query_as(
                    r#"
                    SELECT doc_id, collection, change_vector, deleted_at, etag
                    FROM tombstones
                    WHERE collection = ? COLLATE NOCASE AND etag >= ?
                    ORDER BY etag
                    LIMIT ?
                    "#,
                )
                .bind(collection)
                .bind(from_etag as i64)
                .bind(page_size as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT doc_id, collection, change_vector, deleted_at, etag
                    FROM tombstones
                    WHERE etag >= ?
                    ORDER BY etag
                    LIMIT ?
                    "#,
                )
                .bind(from_etag as i64)
                .bind(page_size as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows
            .into_iter()
            .map(tombstone_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    /// Tombstones by position rather than etag, for the monitoring surface.
    pub async fn tombstones_page(&self, start: u32, page_size: u32) -> Result<Vec<Tombstone>> {
        let rows: Vec<TombstoneRow> = sqlx::query_as(
            r#"
            SELECT doc_id, collection, change_vector, deleted_at, etag
            FROM tombstones
            ORDER BY etag
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(page_size as i64)
        .bind(start as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(tombstone_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    /// Everything written after `etag`, in etag order: current documents,
    /// tombstones and conflict versions (shipped as plain documents or
    /// tombstones so the receiver reproduces the conflict).
    pub async fn changes_since(&self, etag: u64, limit: usize) -> Result<Vec<ReplicationItem>> {
        let rows: Vec<VersionRow> = sqlx::query_as(
            r#"
            SELECT doc_id, collection, change_vector, body, metadata, last_modified, etag
            FROM documents WHERE etag > ?
            UNION ALL
            SELECT doc_id, collection, change_vector, NULL AS body, '{}' AS metadata,
                   deleted_at AS last_modified, etag
            FROM tombstones WHERE etag > ?
            UNION ALL
            SELECT doc_id, collection, change_vector, body, metadata, last_modified, etag
            FROM conflicts WHERE etag > ?
            ORDER BY etag
            LIMIT ?
            "#,
        )
        .bind(etag as i64)
        .bind(etag as i64)
        .bind(etag as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(version_from_row(row)?.to_item());
        }
        Ok(items)
    }
}
