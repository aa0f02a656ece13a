//! HTTP request types for the Depot server.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Header carrying the tenant identifier.
pub const TENANT_HEADER: &str = "X-Tenant-ID";

/// The request's tenant scope; an absent or empty header means the global
/// namespace.
#[derive(Debug, Clone, Default)]
pub struct Tenant(pub Option<String>);

impl Tenant {
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl<S> FromRequestParts<S> for Tenant
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        Ok(Tenant(tenant))
    }
}

/// Body for creating a KV bucket.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKvBucketRequest {
    pub name: String,
    pub description: Option<String>,
    pub max_value_size: Option<i32>,
    pub max_history_per_key: Option<i32>,
    pub ttl_seconds: Option<i64>,
}

/// Body for updating a KV bucket; omitted fields are unchanged.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateKvBucketRequest {
    pub description: Option<String>,
    pub max_value_size: Option<i32>,
    pub max_history_per_key: Option<i32>,
    pub ttl_seconds: Option<i64>,
}

/// Body for putting a value.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutKeyRequest {
    /// Base64 when `base64` is set, otherwise a plain UTF-8 string.
    pub value: Option<String>,
    #[serde(default)]
    pub base64: bool,
    pub ttl_seconds: Option<i64>,
}

impl PutKeyRequest {
    /// Decodes the value bytes. An absent value writes an empty payload.
    pub fn decode_value(&self) -> Result<Vec<u8>> {
        let Some(value) = &self.value else {
            return Ok(Vec::new());
        };
        if self.base64 {
            BASE64
                .decode(value)
                .map_err(|_| Error::validation("Invalid base64 value"))
        } else {
            Ok(value.clone().into_bytes())
        }
    }
}

/// Query parameters for puts; a present `expectedRevision` turns the put
/// into a compare-and-swap.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutKeyParams {
    pub expected_revision: Option<i64>,
}

/// Query parameters for history reads.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<i64>,
}

impl HistoryParams {
    /// The HTTP default of 10 revisions, unless the caller asked otherwise.
    pub fn limit(&self) -> i64 {
        self.limit.filter(|l| *l > 0).unwrap_or(10)
    }
}

/// Body for creating an object bucket.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateObjBucketRequest {
    pub name: String,
    pub description: Option<String>,
    pub chunk_size: Option<i32>,
    pub max_object_size: Option<i64>,
}

/// Body for updating an object bucket.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateObjBucketRequest {
    pub description: Option<String>,
    pub chunk_size: Option<i32>,
    pub max_object_size: Option<i64>,
}

/// Query parameters for watch sockets.
#[derive(Debug, Default, Deserialize)]
pub struct WatchParams {
    pub since: Option<i64>,
    pub replay: Option<bool>,
}

impl WatchParams {
    pub fn since(&self) -> i64 {
        self.since.unwrap_or(0)
    }

    pub fn replay(&self) -> bool {
        self.replay.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_decode_plain_value() {
        // given
        let request = PutKeyRequest {
            value: Some("Hello, World!".to_string()),
            base64: false,
            ttl_seconds: None,
        };

        // when
        let bytes = request.decode_value().unwrap();

        // then
        assert_eq!(bytes, b"Hello, World!");
    }

    #[test]
    fn should_decode_base64_value() {
        // given
        let request = PutKeyRequest {
            value: Some(BASE64.encode(b"Hello, World!")),
            base64: true,
            ttl_seconds: None,
        };

        // when
        let bytes = request.decode_value().unwrap();

        // then
        assert_eq!(bytes, b"Hello, World!");
    }

    #[test]
    fn should_reject_invalid_base64() {
        // given
        let request = PutKeyRequest {
            value: Some("not base64!!!".to_string()),
            base64: true,
            ttl_seconds: None,
        };

        // when
        let result = request.decode_value();

        // then
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn should_write_empty_payload_for_absent_value() {
        // given
        let request = PutKeyRequest {
            value: None,
            base64: false,
            ttl_seconds: None,
        };

        // when/then
        assert!(request.decode_value().unwrap().is_empty());
    }

    #[test]
    fn should_parse_put_request_from_camel_case_json() {
        // given
        let json = r#"{"value": "dg==", "base64": true, "ttlSeconds": 60}"#;

        // when
        let request: PutKeyRequest = serde_json::from_str(json).unwrap();

        // then
        assert!(request.base64);
        assert_eq!(request.ttl_seconds, Some(60));
    }

    #[test]
    fn should_default_history_limit_to_ten() {
        // given/when/then
        assert_eq!(HistoryParams { limit: None }.limit(), 10);
        assert_eq!(HistoryParams { limit: Some(0) }.limit(), 10);
        assert_eq!(HistoryParams { limit: Some(5) }.limit(), 5);
    }

    #[test]
    fn should_default_watch_params() {
        // given
        let params = WatchParams::default();

        // when/then
        assert_eq!(params.since(), 0);
        assert!(!params.replay());
    }
}
