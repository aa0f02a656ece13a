//! WebSocket endpoints for watching store changes.
//!
//! Clients connect per bucket (or per key), optionally passing `since` (the
//! revision to start after) and `replay` (send matching history before live
//! delivery). A `connected` frame acknowledges the subscription; `"ping"`
//! text frames answer `"pong"`.
//!
//! Replay and live delivery are not fenced against each other, so an event
//! may arrive twice across the seam; receivers deduplicate by
//! `(bucket, key, revision)`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use tokio::sync::mpsc;

use super::handlers::AppState;
use super::request::{Tenant, WatchParams};
use crate::error::Result;
use crate::watch::{KvWatchEvent, REPLAY_LIMIT_PER_KEY};

/// Handle GET /api/v1/kv/watch/{bucket}
pub async fn watch_kv_bucket(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(bucket): Path<String>,
    Query(params): Query<WatchParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_kv_bucket_watch(state, socket, tenant, bucket, params))
}

/// Handle GET /api/v1/kv/watch/{bucket}/{key}
pub async fn watch_kv_key(
    State(state): State<AppState>,
    tenant: Tenant,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<WatchParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_kv_key_watch(state, socket, tenant, bucket, key, params))
}

/// Handle GET /api/v1/objects/watch/{bucket}
pub async fn watch_obj_bucket(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(bucket): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_obj_bucket_watch(state, socket, tenant, bucket))
}

async fn run_kv_bucket_watch(
    state: AppState,
    mut socket: WebSocket,
    tenant: Tenant,
    bucket: String,
    params: WatchParams,
) {
    let since = params.since();
    let (id, rx) = state
        .watch
        .subscribe_kv_bucket(tenant.0.clone(), bucket.clone(), since);
    tracing::info!(session = id, bucket = %bucket, since, "Watch session opened");

    let connected = serde_json::json!({"type": "connected", "bucket": bucket, "since": since});
    if socket
        .send(Message::Text(connected.to_string().into()))
        .await
        .is_err()
    {
        state.watch.unsubscribe(id);
        return;
    }

    if params.replay() {
        if let Err(err) = replay_bucket(&state, &mut socket, &tenant, &bucket, since).await {
            tracing::warn!(session = id, error = %err, "History replay failed");
        }
    }

    pump(state, socket, id, rx).await;
}

async fn run_kv_key_watch(
    state: AppState,
    mut socket: WebSocket,
    tenant: Tenant,
    bucket: String,
    key: String,
    params: WatchParams,
) {
    let since = params.since();
    let (id, rx) =
        state
            .watch
            .subscribe_kv_key(tenant.0.clone(), bucket.clone(), key.clone(), since);
    tracing::info!(session = id, bucket = %bucket, key = %key, since, "Key watch session opened");

    let connected =
        serde_json::json!({"type": "connected", "bucket": bucket, "key": key, "since": since});
    if socket
        .send(Message::Text(connected.to_string().into()))
        .await
        .is_err()
    {
        state.watch.unsubscribe(id);
        return;
    }

    if params.replay() {
        if let Err(err) = replay_key(&state, &mut socket, &tenant, &bucket, &key, since).await {
            tracing::warn!(session = id, error = %err, "History replay failed");
        }
    }

    pump(state, socket, id, rx).await;
}

async fn run_obj_bucket_watch(state: AppState, mut socket: WebSocket, tenant: Tenant, bucket: String) {
    let (id, rx) = state
        .watch
        .subscribe_obj_bucket(tenant.0.clone(), bucket.clone());
    tracing::info!(session = id, bucket = %bucket, "Object watch session opened");

    let connected = serde_json::json!({"type": "connected", "bucket": bucket});
    if socket
        .send(Message::Text(connected.to_string().into()))
        .await
        .is_err()
    {
        state.watch.unsubscribe(id);
        return;
    }

    pump(state, socket, id, rx).await;
}

/// Replays history for every key in the bucket, oldest revision first.
async fn replay_bucket(
    state: &AppState,
    socket: &mut WebSocket,
    tenant: &Tenant,
    bucket: &str,
    since: i64,
) -> Result<()> {
    let keys = state.kv.list_keys(tenant.as_deref(), bucket).await?;
    for key in keys {
        replay_key(state, socket, tenant, bucket, &key, since).await?;
    }
    Ok(())
}

/// Replays one key's history, oldest revision first, capped per key.
async fn replay_key(
    state: &AppState,
    socket: &mut WebSocket,
    tenant: &Tenant,
    bucket: &str,
    key: &str,
    since: i64,
) -> Result<()> {
    let mut entries = state
        .kv
        .history(tenant.as_deref(), bucket, key, Some(REPLAY_LIMIT_PER_KEY))
        .await?;
    entries.reverse();
    for entry in entries.iter().filter(|e| e.revision > since) {
        let event = KvWatchEvent::from_entry(entry, bucket);
        let frame = serde_json::to_string(&event).unwrap_or_default();
        if socket.send(Message::Text(frame.into())).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Live delivery loop: forwards registry frames and answers pings until
/// either side goes away.
async fn pump(state: AppState, mut socket: WebSocket, id: u64, mut rx: mpsc::Receiver<String>) {
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if socket.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                    state.metrics.watch_events_total.inc();
                }
                // The registry dropped us (slow consumer or shutdown).
                None => break,
            },
            message = socket.recv() => match message {
                Some(Ok(Message::Text(text))) => {
                    if text.as_str() == "ping"
                        && socket.send(Message::Text("pong".into())).await.is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    state.watch.unsubscribe(id);
    tracing::info!(session = id, "Watch session closed");
}
