//! HTTP route handlers for the KV surface.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;

use super::error::ApiError;
use super::metrics::Metrics;
use super::request::{
    CreateKvBucketRequest, HistoryParams, PutKeyParams, PutKeyRequest, Tenant,
    UpdateKvBucketRequest,
};
use super::response::{CountResponse, KvBucketResponse, KvEntryResponse};
use crate::kv::{KvBucketSpec, KvBucketUpdate, KvStore};
use crate::object::ObjectStore;
use crate::store::Store;
use crate::watch::WatchRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub kv: KvStore,
    pub objects: ObjectStore,
    pub store: Store,
    pub watch: Arc<WatchRegistry>,
    pub metrics: Arc<Metrics>,
}

// ==================== Buckets ====================

/// Handle POST /api/v1/kv/buckets
pub async fn create_bucket(
    State(state): State<AppState>,
    tenant: Tenant,
    Json(request): Json<CreateKvBucketRequest>,
) -> Result<(StatusCode, Json<KvBucketResponse>), ApiError> {
    if request.name.is_empty() || request.name.len() > 255 {
        return Err(ApiError::bad_request(
            "Bucket name must be between 1 and 255 characters",
        ));
    }
    let bucket = state
        .kv
        .create_bucket(
            tenant.as_deref(),
            KvBucketSpec {
                name: request.name,
                description: request.description,
                max_value_size: request.max_value_size,
                max_history_per_key: request.max_history_per_key,
                ttl_seconds: request.ttl_seconds,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(bucket.into())))
}

/// Handle GET /api/v1/kv/buckets
pub async fn list_buckets(
    State(state): State<AppState>,
    tenant: Tenant,
) -> Result<Json<Vec<KvBucketResponse>>, ApiError> {
    let buckets = state.kv.list_buckets(tenant.as_deref()).await?;
    Ok(Json(buckets.into_iter().map(Into::into).collect()))
}

/// Handle GET /api/v1/kv/buckets/{name}
pub async fn get_bucket(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(name): Path<String>,
) -> Result<Json<KvBucketResponse>, ApiError> {
    let bucket = state.kv.get_bucket(tenant.as_deref(), &name).await?;
    Ok(Json(bucket.into()))
}

/// Handle PUT /api/v1/kv/buckets/{name}
pub async fn update_bucket(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(name): Path<String>,
    Json(request): Json<UpdateKvBucketRequest>,
) -> Result<Json<KvBucketResponse>, ApiError> {
    let bucket = state
        .kv
        .update_bucket(
            tenant.as_deref(),
            &name,
            KvBucketUpdate {
                description: request.description,
                max_value_size: request.max_value_size,
                max_history_per_key: request.max_history_per_key,
                ttl_seconds: request.ttl_seconds,
            },
        )
        .await?;
    Ok(Json(bucket.into()))
}

/// Handle DELETE /api/v1/kv/buckets/{name}
pub async fn delete_bucket(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.kv.delete_bucket(tenant.as_deref(), &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handle DELETE /api/v1/kv/buckets/{name}/purge
pub async fn purge_bucket(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(name): Path<String>,
) -> Result<Json<CountResponse>, ApiError> {
    let count = state.kv.purge_bucket(tenant.as_deref(), &name).await?;
    Ok(Json(CountResponse { count }))
}

// ==================== Keys ====================

/// Handle GET /api/v1/kv/buckets/{bucket}/keys
pub async fn list_keys(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(bucket): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    let keys = state.kv.list_keys(tenant.as_deref(), &bucket).await?;
    Ok(Json(keys))
}

/// Handle PUT /api/v1/kv/buckets/{bucket}/keys/{key}
///
/// With `expectedRevision` in the query the put becomes a compare-and-swap
/// and answers 409 `cas-conflict` when it loses.
pub async fn put_key(
    State(state): State<AppState>,
    tenant: Tenant,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<PutKeyParams>,
    Json(request): Json<PutKeyRequest>,
) -> Result<Json<KvEntryResponse>, ApiError> {
    let value = request.decode_value()?;
    let entry = match params.expected_revision {
        Some(expected) => {
            state
                .kv
                .cas_put(
                    tenant.as_deref(),
                    &bucket,
                    &key,
                    value,
                    expected,
                    request.ttl_seconds,
                )
                .await?
        }
        None => {
            state
                .kv
                .put(tenant.as_deref(), &bucket, &key, value, request.ttl_seconds)
                .await?
        }
    };
    state.metrics.kv_op("put");
    Ok(Json(KvEntryResponse::from_entry(entry, &bucket)))
}

/// Handle GET /api/v1/kv/buckets/{bucket}/keys/{key}
pub async fn get_key(
    State(state): State<AppState>,
    tenant: Tenant,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Json<KvEntryResponse>, ApiError> {
    let entry = state.kv.get(tenant.as_deref(), &bucket, &key).await?;
    state.metrics.kv_op("get");
    Ok(Json(KvEntryResponse::from_entry(entry, &bucket)))
}

/// Handle GET /api/v1/kv/buckets/{bucket}/keys/{key}/revision/{revision}
pub async fn get_revision(
    State(state): State<AppState>,
    tenant: Tenant,
    Path((bucket, key, revision)): Path<(String, String, i64)>,
) -> Result<Json<KvEntryResponse>, ApiError> {
    let entry = state
        .kv
        .get_revision(tenant.as_deref(), &bucket, &key, revision)
        .await?;
    Ok(Json(KvEntryResponse::from_entry(entry, &bucket)))
}

/// Handle GET /api/v1/kv/buckets/{bucket}/keys/{key}/history
pub async fn get_history(
    State(state): State<AppState>,
    tenant: Tenant,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<KvEntryResponse>>, ApiError> {
    let entries = state
        .kv
        .history(tenant.as_deref(), &bucket, &key, Some(params.limit()))
        .await?;
    Ok(Json(
        entries
            .into_iter()
            .map(|e| KvEntryResponse::from_entry(e, &bucket))
            .collect(),
    ))
}

/// Handle DELETE /api/v1/kv/buckets/{bucket}/keys/{key}
pub async fn delete_key(
    State(state): State<AppState>,
    tenant: Tenant,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Json<KvEntryResponse>, ApiError> {
    let entry = state.kv.delete(tenant.as_deref(), &bucket, &key).await?;
    state.metrics.kv_op("delete");
    Ok(Json(KvEntryResponse::from_entry(entry, &bucket)))
}

/// Handle DELETE /api/v1/kv/buckets/{bucket}/keys/{key}/purge
pub async fn purge_key(
    State(state): State<AppState>,
    tenant: Tenant,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Json<CountResponse>, ApiError> {
    let count = state.kv.purge_key(tenant.as_deref(), &bucket, &key).await?;
    state.metrics.kv_op("purge");
    Ok(Json(CountResponse { count }))
}

// ==================== Operational ====================

/// Handle GET /metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state
        .metrics
        .watch_subscribers
        .set(state.watch.active_watchers() as i64);
    state.metrics.encode()
}

/// Handle GET /-/healthy
pub async fn healthy() -> &'static str {
    "OK"
}

/// Handle GET /-/ready
pub async fn ready(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    state
        .store
        .health_check()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok("OK")
}
