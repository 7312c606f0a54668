//! Replicated data model.
//!
//! Documents, tombstones and conflict versions exchanged between nodes, plus
//! the identities of the peers on either end of a replication connection.
//!
//! Document identifiers are case-insensitive: `Users/1` and `users/1` name
//! the same document. [`document_key`] produces the normalized form used for
//! storage keys and per-document locking; the original spelling is kept for
//! display.

use crate::change_vector::ChangeVector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Normalized storage key for a document id.
pub fn document_key(id: &str) -> String {
    id.to_lowercase()
}

/// Opaque metadata value. Only primitives are allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Text(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Text(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Integer(v)
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

/// Free-form document metadata.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A document version as stored locally or shipped to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedDocument {
    pub id: String,
    #[serde(default)]
    pub collection: String,
    pub body: serde_json::Value,
    #[serde(default)]
    pub metadata: Metadata,
    pub change_vector: ChangeVector,
    pub last_modified: DateTime<Utc>,
    /// Etag on the node that produced this copy. Reassigned on local write.
    pub etag: u64,
}

/// Deletion marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: String,
    #[serde(default)]
    pub collection: String,
    pub change_vector: ChangeVector,
    pub deleted_at: DateTime<Utc>,
    pub etag: u64,
}

/// One entry of a replication batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicationItem {
    Document(ReplicatedDocument),
    Tombstone(Tombstone),
}

impl ReplicationItem {
    pub fn id(&self) -> &str {
        match self {
            ReplicationItem::Document(d) => &d.id,
            ReplicationItem::Tombstone(t) => &t.id,
        }
    }

    pub fn change_vector(&self) -> &ChangeVector {
        match self {
            ReplicationItem::Document(d) => &d.change_vector,
            ReplicationItem::Tombstone(t) => &t.change_vector,
        }
    }

    pub fn etag(&self) -> u64 {
        match self {
            ReplicationItem::Document(d) => d.etag,
            ReplicationItem::Tombstone(t) => t.etag,
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            ReplicationItem::Document(d) => &d.collection,
            ReplicationItem::Tombstone(t) => &t.collection,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, ReplicationItem::Tombstone(_))
    }
}

/// One competing version inside a [`ConflictRecord`]. `body == None` marks a deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictVersion {
    pub id: String,
    pub collection: String,
    pub change_vector: ChangeVector,
    pub body: Option<serde_json::Value>,
    pub metadata: Metadata,
    pub last_modified: DateTime<Utc>,
    pub etag: u64,
}

impl From<&ReplicationItem> for ConflictVersion {
    fn from(item: &ReplicationItem) -> Self {
        match item {
            ReplicationItem::Document(d) => ConflictVersion {
                id: d.id.clone(),
                collection: d.collection.clone(),
                change_vector: d.change_vector.clone(),
                body: Some(d.body.clone()),
                metadata: d.metadata.clone(),
                last_modified: d.last_modified,
                etag: d.etag,
            },
            ReplicationItem::Tombstone(t) => ConflictVersion {
                id: t.id.clone(),
                collection: t.collection.clone(),
                change_vector: t.change_vector.clone(),
                body: None,
                metadata: Metadata::new(),
                last_modified: t.deleted_at,
                etag: t.etag,
            },
        }
    }
}

impl ConflictVersion {
    pub fn is_deletion(&self) -> bool {
        self.body.is_none()
    }

    /// Ship this version to a peer as a regular document or tombstone.
    pub fn to_item(&self) -> ReplicationItem {
        match &self.body {
            Some(body) => ReplicationItem::Document(ReplicatedDocument {
                id: self.id.clone(),
                collection: self.collection.clone(),
                body: body.clone(),
                metadata: self.metadata.clone(),
                change_vector: self.change_vector.clone(),
                last_modified: self.last_modified,
                etag: self.etag,
            }),
            None => ReplicationItem::Tombstone(Tombstone {
                id: self.id.clone(),
                collection: self.collection.clone(),
                change_vector: self.change_vector.clone(),
                deleted_at: self.last_modified,
                etag: self.etag,
            }),
        }
    }
}

/// All unresolved versions of one document, ordered by etag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    pub versions: Vec<ConflictVersion>,
}

impl ConflictRecord {
    pub fn largest_etag(&self) -> u64 {
        self.versions.iter().map(|v| v.etag).max().unwrap_or(0)
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.versions.iter().map(|v| v.last_modified).max()
    }
}

/// Outgoing replication target.
///
/// Identity is the case-insensitive `(url, database)` pair; the `disabled`
/// flag does not take part in equality or hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReplicationDestination {
    pub url: String,
    pub database: String,
    #[serde(default)]
    pub disabled: bool,
}

impl ReplicationDestination {
    pub fn new(url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: database.into(),
            disabled: false,
        }
    }

    fn key(&self) -> (String, String) {
        (self.url.to_lowercase(), self.database.to_lowercase())
    }
}

impl PartialEq for ReplicationDestination {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ReplicationDestination {}

impl Hash for ReplicationDestination {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for ReplicationDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.database, self.url)
    }
}

/// Identity of the remote end of an incoming connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IncomingConnectionInfo {
    pub source_database_id: String,
    pub source_database_name: String,
    pub source_machine_name: String,
    pub source_url: String,
}

impl IncomingConnectionInfo {
    /// Key used by the single-connection-per-source policy and watermarks.
    pub fn source_key(&self) -> String {
        self.source_database_id.to_lowercase()
    }
}

impl fmt::Display for IncomingConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) at {}",
            self.source_database_name, self.source_database_id, self.source_url
        )
    }
}

/// Reason an incoming connection attempt was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RejectionRecord {
    pub reason: String,
    pub when: DateTime<Utc>,
}
