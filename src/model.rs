//! Core data types for Depot.
//!
//! Persistent entities are plain records decoded straight from their table
//! rows. Updates never mutate KV entry rows; every write appends a new
//! revision and deletes append a tombstone.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

/// Operation recorded on a KV entry revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KvOperation {
    Put,
    Delete,
    Purge,
}

impl KvOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            KvOperation::Put => "PUT",
            KvOperation::Delete => "DELETE",
            KvOperation::Purge => "PURGE",
        }
    }
}

impl std::fmt::Display for KvOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for KvOperation {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "PUT" => Ok(KvOperation::Put),
            "DELETE" => Ok(KvOperation::Delete),
            "PURGE" => Ok(KvOperation::Purge),
            other => Err(format!("unknown kv operation: {other}")),
        }
    }
}

/// Upload lifecycle state of an object's metadata row.
///
/// Only `COMPLETED` metadata is visible to reads; `UPLOADING` and `FAILED`
/// rows are bookkeeping for in-flight or aborted uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObjectStatus {
    Uploading,
    Completed,
    Failed,
}

impl ObjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectStatus::Uploading => "UPLOADING",
            ObjectStatus::Completed => "COMPLETED",
            ObjectStatus::Failed => "FAILED",
        }
    }
}

impl TryFrom<String> for ObjectStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "UPLOADING" => Ok(ObjectStatus::Uploading),
            "COMPLETED" => Ok(ObjectStatus::Completed),
            "FAILED" => Ok(ObjectStatus::Failed),
            other => Err(format!("unknown object status: {other}")),
        }
    }
}

/// A named, tenant-scoped namespace for KV entries.
#[derive(Debug, Clone, FromRow)]
pub struct KvBucket {
    pub id: Uuid,
    pub tenant: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub max_value_size: i32,
    pub max_history_per_key: i32,
    pub ttl_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One revision of a key's value.
///
/// `value` is `None` for tombstones (`operation = DELETE`).
#[derive(Debug, Clone, FromRow)]
pub struct KvEntry {
    pub id: Uuid,
    pub bucket_id: Uuid,
    pub tenant: Option<String>,
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub revision: i64,
    #[sqlx(try_from = "String")]
    pub operation: KvOperation,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl KvEntry {
    /// Whether this entry is past its expiry at the given instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A named, tenant-scoped namespace for objects.
#[derive(Debug, Clone, FromRow)]
pub struct ObjBucket {
    pub id: Uuid,
    pub tenant: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub chunk_size: i32,
    pub max_object_size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Metadata for a stored object. Chunk data lives in `obj_shared_chunks`,
/// addressed through `obj_metadata_chunks` links.
#[derive(Debug, Clone, FromRow)]
pub struct ObjMetadata {
    pub id: Uuid,
    pub bucket_id: Uuid,
    pub tenant: Option<String>,
    pub name: String,
    pub size: i64,
    pub chunk_count: i32,
    pub digest: Option<String>,
    pub digest_algorithm: String,
    pub content_type: Option<String>,
    pub description: Option<String>,
    pub headers: Json<HashMap<String, String>>,
    #[sqlx(try_from = "String")]
    pub status: ObjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_round_trip_operation_names() {
        // given
        let ops = [KvOperation::Put, KvOperation::Delete, KvOperation::Purge];

        // when/then
        for op in ops {
            assert_eq!(KvOperation::try_from(op.as_str().to_string()), Ok(op));
        }
    }

    #[test]
    fn should_reject_unknown_operation() {
        // given
        let raw = "UPSERT".to_string();

        // when
        let result = KvOperation::try_from(raw);

        // then
        assert!(result.is_err());
    }

    #[test]
    fn should_detect_expired_entries() {
        // given
        let now = Utc::now();
        let entry = KvEntry {
            id: Uuid::new_v4(),
            bucket_id: Uuid::new_v4(),
            tenant: None,
            key: "k".to_string(),
            value: Some(b"v".to_vec()),
            revision: 1,
            operation: KvOperation::Put,
            created_at: now - chrono::Duration::seconds(120),
            expires_at: Some(now - chrono::Duration::seconds(60)),
        };

        // when/then
        assert!(entry.is_expired(now));
        assert!(!entry.is_expired(now - chrono::Duration::seconds(90)));
    }

    #[test]
    fn should_keep_unexpired_entry_visible() {
        // given
        let now = Utc::now();
        let entry = KvEntry {
            id: Uuid::new_v4(),
            bucket_id: Uuid::new_v4(),
            tenant: None,
            key: "k".to_string(),
            value: Some(b"v".to_vec()),
            revision: 1,
            operation: KvOperation::Put,
            created_at: now,
            expires_at: None,
        };

        // when/then
        assert!(!entry.is_expired(now));
    }
}
