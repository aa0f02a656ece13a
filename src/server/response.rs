//! HTTP response types for the Depot server.
//!
//! Wire field names are camelCase; binary values travel as base64.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::model::{KvBucket, KvEntry, ObjBucket, ObjMetadata};

/// KV bucket representation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KvBucketResponse {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub max_value_size: i32,
    pub max_history_per_key: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<KvBucket> for KvBucketResponse {
    fn from(bucket: KvBucket) -> Self {
        Self {
            id: bucket.id,
            name: bucket.name,
            description: bucket.description,
            max_value_size: bucket.max_value_size,
            max_history_per_key: bucket.max_history_per_key,
            ttl_seconds: bucket.ttl_seconds,
            created_at: bucket.created_at,
            updated_at: bucket.updated_at,
        }
    }
}

/// KV entry representation. `value` is base64; tombstones have none.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KvEntryResponse {
    pub id: Uuid,
    pub bucket: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub revision: i64,
    pub operation: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl KvEntryResponse {
    pub fn from_entry(entry: KvEntry, bucket: &str) -> Self {
        Self {
            id: entry.id,
            bucket: bucket.to_string(),
            key: entry.key,
            value: entry.value.map(|v| BASE64.encode(v)),
            revision: entry.revision,
            operation: entry.operation.as_str().to_string(),
            created_at: entry.created_at,
            expires_at: entry.expires_at,
        }
    }
}

/// Object bucket representation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjBucketResponse {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub chunk_size: i32,
    pub max_object_size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ObjBucket> for ObjBucketResponse {
    fn from(bucket: ObjBucket) -> Self {
        Self {
            id: bucket.id,
            name: bucket.name,
            description: bucket.description,
            chunk_size: bucket.chunk_size,
            max_object_size: bucket.max_object_size,
            created_at: bucket.created_at,
            updated_at: bucket.updated_at,
        }
    }
}

/// Full object metadata representation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjMetadataResponse {
    pub id: Uuid,
    pub bucket: String,
    pub name: String,
    pub size: i64,
    pub chunk_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub digest_algorithm: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub headers: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ObjMetadataResponse {
    pub fn from_metadata(metadata: ObjMetadata, bucket: &str) -> Self {
        Self {
            id: metadata.id,
            bucket: bucket.to_string(),
            name: metadata.name,
            size: metadata.size,
            chunk_count: metadata.chunk_count,
            digest: metadata.digest,
            digest_algorithm: metadata.digest_algorithm,
            content_type: metadata.content_type,
            description: metadata.description,
            headers: metadata.headers.0,
            created_at: metadata.created_at,
            updated_at: metadata.updated_at,
        }
    }
}

/// Minimal object listing entry.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub name: String,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<ObjMetadata> for ObjectInfo {
    fn from(metadata: ObjMetadata) -> Self {
        Self {
            name: metadata.name,
            size: metadata.size,
            digest: metadata.digest,
            content_type: metadata.content_type,
            created_at: metadata.created_at,
        }
    }
}

/// Count of affected rows for purge endpoints.
#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: u64,
}

/// Integrity verification result.
#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub valid: bool,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::KvOperation;
    use sqlx::types::Json;

    fn entry(value: Option<Vec<u8>>, operation: KvOperation) -> KvEntry {
        KvEntry {
            id: Uuid::new_v4(),
            bucket_id: Uuid::new_v4(),
            tenant: None,
            key: "greeting".to_string(),
            value,
            revision: 2,
            operation,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[test]
    fn should_serialize_entry_with_base64_value() {
        // given
        let response =
            KvEntryResponse::from_entry(entry(Some(b"Hello, World!".to_vec()), KvOperation::Put), "b");

        // when
        let json = serde_json::to_string(&response).unwrap();

        // then
        assert!(json.contains(r#""bucket":"b""#));
        assert!(json.contains(r#""key":"greeting""#));
        assert!(json.contains(&format!(r#""value":"{}""#, BASE64.encode(b"Hello, World!"))));
        assert!(json.contains(r#""operation":"PUT""#));
        assert!(json.contains(r#""createdAt":"#));
    }

    #[test]
    fn should_omit_value_for_tombstones() {
        // given
        let response = KvEntryResponse::from_entry(entry(None, KvOperation::Delete), "b");

        // when
        let json = serde_json::to_string(&response).unwrap();

        // then
        assert!(!json.contains(r#""value""#));
        assert!(json.contains(r#""operation":"DELETE""#));
    }

    #[test]
    fn should_serialize_metadata_with_camel_case_fields() {
        // given
        let metadata = ObjMetadata {
            id: Uuid::new_v4(),
            bucket_id: Uuid::new_v4(),
            tenant: None,
            name: "report.bin".to_string(),
            size: 5_242_880,
            chunk_count: 5,
            digest: Some("abc".to_string()),
            digest_algorithm: "SHA-256".to_string(),
            content_type: Some("application/octet-stream".to_string()),
            description: None,
            headers: Json(HashMap::new()),
            status: crate::model::ObjectStatus::Completed,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        // when
        let json =
            serde_json::to_string(&ObjMetadataResponse::from_metadata(metadata, "files")).unwrap();

        // then
        assert!(json.contains(r#""chunkCount":5"#));
        assert!(json.contains(r#""digestAlgorithm":"SHA-256""#));
        assert!(json.contains(r#""size":5242880"#));
    }

    #[test]
    fn should_serialize_count_response() {
        // given/when
        let json = serde_json::to_string(&CountResponse { count: 3 }).unwrap();

        // then
        assert_eq!(json, r#"{"count":3}"#);
    }
}
