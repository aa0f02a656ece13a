//! HTTP error mapping for the Depot server.
//!
//! Engine errors become `{status, error, message, path, timestamp}` JSON
//! bodies. The request path is not known at conversion time; the
//! `attach_error_path` middleware fills it in from the request before the
//! response leaves the server.

use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Error;
use crate::range::unsatisfiable_content_range;

/// JSON body for error responses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub status: u16,
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// An error ready to be rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
    content_range: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error,
            message: message.into(),
            content_range: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "Bad Request", message)
    }

    /// 416 with the `Content-Range: bytes */size` hint.
    pub fn range_not_satisfiable(size: u64) -> Self {
        let mut err = Self::new(
            StatusCode::RANGE_NOT_SATISFIABLE,
            "Range Not Satisfiable",
            format!("Requested range not satisfiable for object of {size} bytes"),
        );
        err.content_range = Some(unsatisfiable_content_range(size));
        err
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound(message) => Self::new(StatusCode::NOT_FOUND, "Not Found", message),
            Error::Conflict(message) => Self::new(StatusCode::CONFLICT, "Conflict", message),
            Error::CasConflict { expected, current } => Self::new(
                StatusCode::CONFLICT,
                "cas-conflict",
                format!("expected revision {expected}, current revision is {current}"),
            ),
            Error::Validation(message) => {
                Self::new(StatusCode::BAD_REQUEST, "Bad Request", message)
            }
            Error::UnsatisfiableRange { size } => Self::range_not_satisfiable(size.max(0) as u64),
            Error::Database(db) => {
                tracing::error!(error = %db, "Database error");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                    "An unexpected error occurred",
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            status: self.status.as_u16(),
            error: self.error.to_string(),
            message: self.message,
            path: None,
            timestamp: Utc::now(),
        };
        let mut response = (self.status, Json(body.clone())).into_response();
        response.extensions_mut().insert(body);
        if let Some(content_range) = self.content_range {
            if let Ok(value) = content_range.parse() {
                response
                    .headers_mut()
                    .insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}

/// Rewrites error bodies to include the request path.
pub async fn attach_error_path(req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let mut response = next.run(req).await;
    if let Some(mut body) = response.extensions_mut().remove::<ErrorBody>() {
        body.path = Some(path);
        let status = response.status();
        let headers = response.headers().clone();
        let mut rebuilt = (status, Json(body)).into_response();
        for (name, value) in headers.iter() {
            if name != header::CONTENT_LENGTH && name != header::CONTENT_TYPE {
                rebuilt.headers_mut().insert(name.clone(), value.clone());
            }
        }
        return rebuilt;
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_map_not_found_to_404() {
        // given
        let err = Error::not_found("Bucket not found: b");

        // when
        let api: ApiError = err.into();

        // then
        assert_eq!(api.status(), StatusCode::NOT_FOUND);
        assert_eq!(api.error, "Not Found");
    }

    #[test]
    fn should_map_conflicts_to_409() {
        // given/when
        let duplicate: ApiError = Error::conflict("Bucket already exists: b").into();
        let cas: ApiError = Error::CasConflict {
            expected: 1,
            current: 2,
        }
        .into();

        // then
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);
        assert_eq!(duplicate.error, "Conflict");
        assert_eq!(cas.status(), StatusCode::CONFLICT);
        assert_eq!(cas.error, "cas-conflict");
    }

    #[test]
    fn should_map_validation_to_400() {
        // given/when
        let api: ApiError = Error::validation("Invalid base64 value").into();

        // then
        assert_eq!(api.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn should_hide_database_detail_behind_500() {
        // given
        let err = Error::Database(sqlx::Error::PoolClosed);

        // when
        let api: ApiError = err.into();

        // then
        assert_eq!(api.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api.message, "An unexpected error occurred");
    }

    #[test]
    fn should_carry_content_range_on_416() {
        // given/when
        let api = ApiError::range_not_satisfiable(36);

        // then
        assert_eq!(api.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(api.content_range.as_deref(), Some("bytes */36"));
    }

    #[test]
    fn should_serialize_error_body_with_camel_case() {
        // given
        let body = ErrorBody {
            status: 404,
            error: "Not Found".to_string(),
            message: "Key not found: b/k".to_string(),
            path: Some("/api/v1/kv/buckets/b/keys/k".to_string()),
            timestamp: Utc::now(),
        };

        // when
        let json = serde_json::to_string(&body).unwrap();

        // then
        assert!(json.contains(r#""status":404"#));
        assert!(json.contains(r#""error":"Not Found""#));
        assert!(json.contains(r#""path":"/api/v1/kv/buckets/b/keys/k""#));
        assert!(json.contains(r#""timestamp":"#));
    }
}
