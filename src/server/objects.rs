//! HTTP route handlers for the object store surface.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::error::ApiError;
use super::handlers::AppState;
use super::request::{CreateObjBucketRequest, Tenant, UpdateObjBucketRequest};
use super::response::{ObjBucketResponse, ObjMetadataResponse, ObjectInfo, VerifyResponse};
use crate::model::ObjMetadata;
use crate::object::{ObjBucketSpec, ObjBucketUpdate, UploadAttrs};
use crate::range;

/// Header carrying a human-readable object description on upload.
pub const DESCRIPTION_HEADER: &str = "X-Object-Description";

// ==================== Buckets ====================

/// Handle POST /api/v1/objects/buckets
pub async fn create_bucket(
    State(state): State<AppState>,
    tenant: Tenant,
    Json(request): Json<CreateObjBucketRequest>,
) -> Result<(StatusCode, Json<ObjBucketResponse>), ApiError> {
    if request.name.is_empty() || request.name.len() > 255 {
        return Err(ApiError::bad_request(
            "Bucket name must be between 1 and 255 characters",
        ));
    }
    let bucket = state
        .objects
        .create_bucket(
            tenant.as_deref(),
            ObjBucketSpec {
                name: request.name,
                description: request.description,
                chunk_size: request.chunk_size,
                max_object_size: request.max_object_size,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(bucket.into())))
}

/// Handle GET /api/v1/objects/buckets
pub async fn list_buckets(
    State(state): State<AppState>,
    tenant: Tenant,
) -> Result<Json<Vec<ObjBucketResponse>>, ApiError> {
    let buckets = state.objects.list_buckets(tenant.as_deref()).await?;
    Ok(Json(buckets.into_iter().map(Into::into).collect()))
}

/// Handle GET /api/v1/objects/buckets/{name}
pub async fn get_bucket(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(name): Path<String>,
) -> Result<Json<ObjBucketResponse>, ApiError> {
    let bucket = state.objects.get_bucket(tenant.as_deref(), &name).await?;
    Ok(Json(bucket.into()))
}

/// Handle PUT /api/v1/objects/buckets/{name}
pub async fn update_bucket(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(name): Path<String>,
    Json(request): Json<UpdateObjBucketRequest>,
) -> Result<Json<ObjBucketResponse>, ApiError> {
    let bucket = state
        .objects
        .update_bucket(
            tenant.as_deref(),
            &name,
            ObjBucketUpdate {
                description: request.description,
                chunk_size: request.chunk_size,
                max_object_size: request.max_object_size,
            },
        )
        .await?;
    Ok(Json(bucket.into()))
}

/// Handle DELETE /api/v1/objects/buckets/{name}
pub async fn delete_bucket(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.objects.delete_bucket(tenant.as_deref(), &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ==================== Objects ====================

/// Handle GET /api/v1/objects/buckets/{bucket}/objects
pub async fn list_objects(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(bucket): Path<String>,
) -> Result<Json<Vec<ObjectInfo>>, ApiError> {
    let objects = state.objects.list_objects(tenant.as_deref(), &bucket).await?;
    Ok(Json(objects.into_iter().map(Into::into).collect()))
}

/// Handle PUT /api/v1/objects/buckets/{bucket}/objects/{name}
///
/// The octet-stream body is chunked as it arrives; an existing object of
/// the same name is replaced.
pub async fn upload_object(
    State(state): State<AppState>,
    tenant: Tenant,
    Path((bucket, name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<ObjMetadataResponse>, ApiError> {
    let content_type = header_string(&headers, header::CONTENT_TYPE.as_str());
    let description = header_string(&headers, DESCRIPTION_HEADER);

    let mut custom_headers = std::collections::HashMap::new();
    if let Some(description) = &description {
        custom_headers.insert(DESCRIPTION_HEADER.to_string(), description.clone());
    }

    let metadata = state
        .objects
        .put_object(
            tenant.as_deref(),
            &bucket,
            &name,
            UploadAttrs {
                content_type,
                description,
                headers: custom_headers,
            },
            body.into_data_stream(),
        )
        .await?;

    state.metrics.object_uploads_total.inc();
    state
        .metrics
        .object_bytes_written_total
        .inc_by(metadata.size.max(0) as u64);
    Ok(Json(ObjMetadataResponse::from_metadata(metadata, &bucket)))
}

/// Handle GET /api/v1/objects/buckets/{bucket}/objects/{name}
///
/// A `Range` header yields 206 with `Content-Range`, or 416 when the range
/// cannot be satisfied; otherwise the full body is returned.
pub async fn download_object(
    State(state): State<AppState>,
    tenant: Tenant,
    Path((bucket, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let metadata = state
        .objects
        .get_metadata(tenant.as_deref(), &bucket, &name)
        .await?;
    let size = metadata.size as u64;

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match range_header {
        None => {
            let data = state.objects.read_all(tenant.as_deref(), &bucket, &name).await?;
            Ok(object_response(StatusCode::OK, &metadata, None, data))
        }
        Some(raw) => {
            let parsed = range::parse_range_header(&raw)
                .ok_or_else(|| ApiError::bad_request(format!("Invalid Range header: {raw}")))?;
            let resolved = range::resolve(parsed, size)
                .map_err(|_| ApiError::range_not_satisfiable(size))?;
            let data = state
                .objects
                .read_range(
                    tenant.as_deref(),
                    &bucket,
                    &name,
                    resolved.offset,
                    resolved.length,
                )
                .await?;
            Ok(object_response(
                StatusCode::PARTIAL_CONTENT,
                &metadata,
                Some(resolved.content_range(size)),
                data,
            ))
        }
    }
}

/// Handle GET /api/v1/objects/buckets/{bucket}/objects/{name}/metadata
pub async fn get_metadata(
    State(state): State<AppState>,
    tenant: Tenant,
    Path((bucket, name)): Path<(String, String)>,
) -> Result<Json<ObjMetadataResponse>, ApiError> {
    let metadata = state
        .objects
        .get_metadata(tenant.as_deref(), &bucket, &name)
        .await?;
    Ok(Json(ObjMetadataResponse::from_metadata(metadata, &bucket)))
}

/// Handle GET /api/v1/objects/buckets/{bucket}/objects/{name}/verify
pub async fn verify_object(
    State(state): State<AppState>,
    tenant: Tenant,
    Path((bucket, name)): Path<(String, String)>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let report = state.objects.verify(tenant.as_deref(), &bucket, &name).await?;
    Ok(Json(VerifyResponse {
        valid: report.valid,
        message: report.message,
    }))
}

/// Handle DELETE /api/v1/objects/buckets/{bucket}/objects/{name}
pub async fn delete_object(
    State(state): State<AppState>,
    tenant: Tenant,
    Path((bucket, name)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .objects
        .delete_object(tenant.as_deref(), &bucket, &name)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn object_response(
    status: StatusCode,
    metadata: &ObjMetadata,
    content_range: Option<String>,
    data: Vec<u8>,
) -> Response {
    let mut response = (status, data).into_response();
    let headers = response.headers_mut();

    let content_type = metadata
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    if let Ok(value) = content_type.parse() {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = format!("attachment; filename=\"{}\"", metadata.name).parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Some(digest) = &metadata.digest {
        if let Ok(value) = digest.parse() {
            headers.insert("X-Object-Digest", value);
        }
    }
    if let Ok(value) = metadata.digest_algorithm.parse() {
        headers.insert("X-Object-Digest-Algorithm", value);
    }
    if let Some(content_range) = content_range {
        if let Ok(value) = content_range.parse() {
            headers.insert(header::CONTENT_RANGE, value);
        }
    }
    response
}
