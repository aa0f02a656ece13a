//! LISTEN/NOTIFY consumer feeding the watch registry.
//!
//! A single dedicated connection listens on the `store_changes` channel.
//! Each payload carries the table, the action, and a row image (see
//! `schema.sql`); the listener decodes it, resolves the bucket name, builds
//! the client-facing event, and hands it to the registry for fan-out.
//!
//! Bucket rows keep the id-to-name cache current. Entry payloads also carry
//! the bucket name resolved in the writing session, which covers buckets
//! created before this process started listening; an event whose bucket
//! cannot be resolved either way is dropped (the client's next read sees the
//! state anyway).

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::store::Store;
use crate::watch::{KvWatchEvent, ObjectWatchEvent, WatchRegistry};

/// Notification channel shared by all store triggers.
pub const CHANNEL: &str = "store_changes";

/// Background consumer of store change notifications.
pub struct ChangeListener {
    store: Store,
    registry: Arc<WatchRegistry>,
}

impl ChangeListener {
    pub fn new(store: Store, registry: Arc<WatchRegistry>) -> Self {
        Self { store, registry }
    }

    /// Seeds the bucket name cache.
    ///
    /// Row-level security limits an unbound session to global buckets;
    /// tenant buckets enter the cache through their own change
    /// notifications or the names carried in entry payloads.
    pub async fn seed_bucket_cache(&self) -> Result<()> {
        let mut tx = self.store.begin(None).await?;
        let kv: Vec<(Uuid, Option<String>, String)> =
            sqlx::query_as("SELECT id, tenant, name FROM kv_buckets")
                .fetch_all(tx.conn())
                .await?;
        let obj: Vec<(Uuid, Option<String>, String)> =
            sqlx::query_as("SELECT id, tenant, name FROM obj_buckets")
                .fetch_all(tx.conn())
                .await?;
        tx.commit().await?;

        let seeded = kv.len() + obj.len();
        for (id, tenant, name) in kv {
            self.registry.cache_kv_bucket(id, tenant, name);
        }
        for (id, tenant, name) in obj {
            self.registry.cache_obj_bucket(id, tenant, name);
        }
        tracing::info!(seeded, "Seeded watch bucket cache");
        Ok(())
    }

    /// Runs until cancelled. The underlying listener reconnects and
    /// re-issues LISTEN on connection loss; events emitted while
    /// disconnected are lost, which watch clients must tolerate.
    pub async fn run(self, cancel: CancellationToken) {
        let mut listener = loop {
            match PgListener::connect_with(self.store.pool()).await {
                Ok(listener) => break listener,
                Err(err) => {
                    tracing::error!(error = %err, "Failed to connect notification listener, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                    }
                }
            }
        };
        if let Err(err) = listener.listen(CHANNEL).await {
            tracing::error!(error = %err, "Failed to LISTEN on change channel");
            return;
        }
        tracing::info!(channel = CHANNEL, "Listening for store change notifications");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Change listener shutting down");
                    return;
                }
                notification = listener.recv() => match notification {
                    Ok(notification) => {
                        handle_payload(&self.registry, notification.payload());
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "Notification stream error, reconnecting");
                    }
                },
            }
        }
    }
}

/// Decodes one notification payload and updates the registry.
pub(crate) fn handle_payload(registry: &WatchRegistry, payload: &str) {
    let root: Value = match serde_json::from_str(payload) {
        Ok(root) => root,
        Err(err) => {
            tracing::warn!(error = %err, "Dropping undecodable notification");
            return;
        }
    };
    let Some(table) = root.get("table").and_then(Value::as_str) else {
        return;
    };
    let Some(action) = root.get("action").and_then(Value::as_str) else {
        return;
    };
    let Some(row) = root.get("new").or_else(|| root.get("old")) else {
        return;
    };

    match table {
        "kv_entries" => handle_kv_entry(registry, action, row),
        "obj_metadata" => handle_obj_metadata(registry, action, row),
        "kv_buckets" => handle_kv_bucket(registry, action, row),
        "obj_buckets" => handle_obj_bucket(registry, action, row),
        _ => {}
    }
}

fn handle_kv_entry(registry: &WatchRegistry, action: &str, row: &Value) {
    // Row removals (history pruning, TTL sweep, purge) carry stale
    // revisions; purges announce themselves with an explicit action.
    let event_type = match action {
        "INSERT" => match str_field(row, "operation") {
            Some(op) => op.to_string(),
            None => return,
        },
        "PURGE" => "PURGE".to_string(),
        _ => return,
    };

    let tenant = opt_str_field(row, "tenant");
    let Some((bucket, tenant)) = resolve_kv_bucket(registry, row, tenant) else {
        tracing::debug!("Dropping kv event for unknown bucket");
        return;
    };
    let Some(key) = str_field(row, "key") else {
        return;
    };

    let value = match event_type.as_str() {
        "PUT" => str_field(row, "value")
            .and_then(decode_bytea)
            .map(|bytes| BASE64.encode(bytes)),
        _ => None,
    };

    let event = KvWatchEvent {
        event_type,
        bucket,
        key: key.to_string(),
        value,
        revision: row.get("revision").and_then(Value::as_i64),
        timestamp: timestamp_field(row, "created_at"),
    };
    registry.dispatch_kv(tenant.as_deref(), &event);
}

fn handle_obj_metadata(registry: &WatchRegistry, action: &str, row: &Value) {
    let status = str_field(row, "status");
    let event_type = match (action, status) {
        // The finalize transition is the only UPDATE clients care about.
        ("UPDATE", Some("COMPLETED")) => "PUT",
        ("DELETE", Some("COMPLETED")) => "DELETE",
        _ => return,
    };

    let tenant = opt_str_field(row, "tenant");
    let Some((bucket, tenant)) = resolve_obj_bucket(registry, row, tenant) else {
        tracing::debug!("Dropping object event for unknown bucket");
        return;
    };
    let Some(name) = str_field(row, "name") else {
        return;
    };

    let event = ObjectWatchEvent {
        event_type: event_type.to_string(),
        bucket,
        name: name.to_string(),
        size: (event_type == "PUT")
            .then(|| row.get("size").and_then(Value::as_i64))
            .flatten(),
        digest: (event_type == "PUT")
            .then(|| str_field(row, "digest").map(str::to_string))
            .flatten(),
        timestamp: timestamp_field(row, "updated_at"),
    };
    registry.dispatch_object(tenant.as_deref(), &event);
}

fn handle_kv_bucket(registry: &WatchRegistry, action: &str, row: &Value) {
    let Some(id) = uuid_field(row, "id") else {
        return;
    };
    match action {
        "INSERT" | "UPDATE" => {
            if let Some(name) = str_field(row, "name") {
                registry.cache_kv_bucket(id, opt_str_field(row, "tenant"), name.to_string());
            }
        }
        "DELETE" => registry.forget_kv_bucket(id),
        _ => {}
    }
}

fn handle_obj_bucket(registry: &WatchRegistry, action: &str, row: &Value) {
    let Some(id) = uuid_field(row, "id") else {
        return;
    };
    match action {
        "INSERT" | "UPDATE" => {
            if let Some(name) = str_field(row, "name") {
                registry.cache_obj_bucket(id, opt_str_field(row, "tenant"), name.to_string());
            }
        }
        "DELETE" => registry.forget_obj_bucket(id),
        _ => {}
    }
}

/// Cache first, then the name the writing session resolved into the payload
/// (also back-filling the cache).
fn resolve_kv_bucket(
    registry: &WatchRegistry,
    row: &Value,
    tenant: Option<String>,
) -> Option<(String, Option<String>)> {
    if let Some(id) = uuid_field(row, "bucket_id") {
        if let Some((cached_tenant, name)) = registry.resolve_kv_bucket(id) {
            return Some((name, cached_tenant));
        }
        if let Some(name) = str_field(row, "bucket_name") {
            registry.cache_kv_bucket(id, tenant.clone(), name.to_string());
            return Some((name.to_string(), tenant));
        }
    }
    None
}

fn resolve_obj_bucket(
    registry: &WatchRegistry,
    row: &Value,
    tenant: Option<String>,
) -> Option<(String, Option<String>)> {
    if let Some(id) = uuid_field(row, "bucket_id") {
        if let Some((cached_tenant, name)) = registry.resolve_obj_bucket(id) {
            return Some((name, cached_tenant));
        }
        if let Some(name) = str_field(row, "bucket_name") {
            registry.cache_obj_bucket(id, tenant.clone(), name.to_string());
            return Some((name.to_string(), tenant));
        }
    }
    None
}

fn str_field<'a>(row: &'a Value, field: &str) -> Option<&'a str> {
    row.get(field).and_then(Value::as_str)
}

fn opt_str_field(row: &Value, field: &str) -> Option<String> {
    row.get(field).and_then(Value::as_str).map(str::to_string)
}

fn uuid_field(row: &Value, field: &str) -> Option<Uuid> {
    row.get(field)
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

fn timestamp_field(row: &Value, field: &str) -> DateTime<Utc> {
    row.get(field)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// Decodes PostgreSQL's hex bytea rendering (`\x6465...`).
fn decode_bytea(text: &str) -> Option<Vec<u8>> {
    hex::decode(text.strip_prefix("\\x")?).ok()
}
