//! Watch subscription registry and event fan-out.
//!
//! One process-wide registry tracks every live watch socket. Subscribers are
//! keyed by a bucket scope or a key scope (always tenant-qualified) and
//! receive pre-serialized event frames over a bounded queue. Dispatch never
//! blocks on a slow client: a full queue disconnects that subscriber,
//! everyone else is unaffected.
//!
//! The registry also caches bucket id to name mappings so the notification
//! listener can resolve row images without a database round trip. It is
//! seeded at startup and updated from bucket change notifications.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::{KvEntry, KvOperation, ObjMetadata};

/// Frames buffered per subscriber before it is considered too slow and
/// disconnected.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

/// Maximum history entries replayed per key on subscribe.
pub const REPLAY_LIMIT_PER_KEY: i64 = 100;

/// A KV change event as delivered to watch sockets.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KvWatchEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub bucket: String,
    pub key: String,
    /// Base64 value; absent for tombstones, purges, and oversized payloads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl KvWatchEvent {
    /// Builds an event from a stored entry (the replay path).
    pub fn from_entry(entry: &KvEntry, bucket: &str) -> Self {
        let value = match (&entry.value, entry.operation) {
            (Some(value), KvOperation::Put) => Some(BASE64.encode(value)),
            _ => None,
        };
        Self {
            event_type: entry.operation.as_str().to_string(),
            bucket: bucket.to_string(),
            key: entry.key.clone(),
            value,
            revision: Some(entry.revision),
            timestamp: entry.created_at,
        }
    }
}

/// An object change event as delivered to watch sockets.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectWatchEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub bucket: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ObjectWatchEvent {
    pub fn from_put(metadata: &ObjMetadata, bucket: &str) -> Self {
        Self {
            event_type: "PUT".to_string(),
            bucket: bucket.to_string(),
            name: metadata.name.clone(),
            size: Some(metadata.size),
            digest: metadata.digest.clone(),
            timestamp: metadata.updated_at,
        }
    }

    pub fn from_delete(bucket: &str, name: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type: "DELETE".to_string(),
            bucket: bucket.to_string(),
            name: name.to_string(),
            size: None,
            digest: None,
            timestamp,
        }
    }
}

/// What a subscriber is watching.
#[derive(Debug, Clone)]
enum Scope {
    KvBucket(String),
    KvKey(String, String),
    ObjBucket(String),
}

struct Subscription {
    tenant: Option<String>,
    scope: Scope,
    since: i64,
    tx: mpsc::Sender<String>,
}

type BucketScope = (Option<String>, String);
type KeyScope = (Option<String>, String, String);

/// Process-wide watch state. Constructed once at startup.
#[derive(Default)]
pub struct WatchRegistry {
    next_id: AtomicU64,
    subscriptions: DashMap<u64, Subscription>,
    kv_bucket_watchers: DashMap<BucketScope, HashSet<u64>>,
    kv_key_watchers: DashMap<KeyScope, HashSet<u64>>,
    obj_bucket_watchers: DashMap<BucketScope, HashSet<u64>>,
    kv_bucket_names: DashMap<Uuid, BucketScope>,
    obj_bucket_names: DashMap<Uuid, BucketScope>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== Subscriptions ====================

    pub fn subscribe_kv_bucket(
        &self,
        tenant: Option<String>,
        bucket: String,
        since: i64,
    ) -> (u64, mpsc::Receiver<String>) {
        let (id, rx) = self.register(tenant.clone(), Scope::KvBucket(bucket.clone()), since);
        self.kv_bucket_watchers
            .entry((tenant, bucket))
            .or_default()
            .insert(id);
        (id, rx)
    }

    pub fn subscribe_kv_key(
        &self,
        tenant: Option<String>,
        bucket: String,
        key: String,
        since: i64,
    ) -> (u64, mpsc::Receiver<String>) {
        let (id, rx) = self.register(
            tenant.clone(),
            Scope::KvKey(bucket.clone(), key.clone()),
            since,
        );
        self.kv_key_watchers
            .entry((tenant, bucket, key))
            .or_default()
            .insert(id);
        (id, rx)
    }

    pub fn subscribe_obj_bucket(
        &self,
        tenant: Option<String>,
        bucket: String,
    ) -> (u64, mpsc::Receiver<String>) {
        let (id, rx) = self.register(tenant.clone(), Scope::ObjBucket(bucket.clone()), 0);
        self.obj_bucket_watchers
            .entry((tenant, bucket))
            .or_default()
            .insert(id);
        (id, rx)
    }

    fn register(
        &self,
        tenant: Option<String>,
        scope: Scope,
        since: i64,
    ) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.subscriptions.insert(
            id,
            Subscription {
                tenant,
                scope,
                since,
                tx,
            },
        );
        tracing::debug!(session = id, "Watch session subscribed");
        (id, rx)
    }

    /// Removes a subscriber from the session index and its scope map.
    pub fn unsubscribe(&self, id: u64) {
        let Some((_, sub)) = self.subscriptions.remove(&id) else {
            return;
        };
        match sub.scope {
            Scope::KvBucket(bucket) => {
                remove_watcher(&self.kv_bucket_watchers, (sub.tenant, bucket), id)
            }
            Scope::KvKey(bucket, key) => {
                remove_watcher(&self.kv_key_watchers, (sub.tenant, bucket, key), id)
            }
            Scope::ObjBucket(bucket) => {
                remove_watcher(&self.obj_bucket_watchers, (sub.tenant, bucket), id)
            }
        }
        tracing::debug!(session = id, "Watch session unsubscribed");
    }

    // ==================== Bucket name cache ====================

    pub fn cache_kv_bucket(&self, id: Uuid, tenant: Option<String>, name: String) {
        self.kv_bucket_names.insert(id, (tenant, name));
    }

    pub fn forget_kv_bucket(&self, id: Uuid) {
        self.kv_bucket_names.remove(&id);
    }

    pub fn resolve_kv_bucket(&self, id: Uuid) -> Option<BucketScope> {
        self.kv_bucket_names.get(&id).map(|e| e.value().clone())
    }

    pub fn cache_obj_bucket(&self, id: Uuid, tenant: Option<String>, name: String) {
        self.obj_bucket_names.insert(id, (tenant, name));
    }

    pub fn forget_obj_bucket(&self, id: Uuid) {
        self.obj_bucket_names.remove(&id);
    }

    pub fn resolve_obj_bucket(&self, id: Uuid) -> Option<BucketScope> {
        self.obj_bucket_names.get(&id).map(|e| e.value().clone())
    }

    // ==================== Dispatch ====================

    /// Fans a KV event out to bucket- and key-scoped subscribers.
    pub fn dispatch_kv(&self, tenant: Option<&str>, event: &KvWatchEvent) {
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(error = %err, "Failed to serialize watch event");
                return;
            }
        };

        let mut targets = watcher_ids(
            &self.kv_bucket_watchers,
            &(tenant.map(str::to_string), event.bucket.clone()),
        );
        targets.extend(watcher_ids(
            &self.kv_key_watchers,
            &(
                tenant.map(str::to_string),
                event.bucket.clone(),
                event.key.clone(),
            ),
        ));
        self.send_frame(&targets, &frame, event.revision);
    }

    /// Fans an object event out to bucket-scoped subscribers.
    pub fn dispatch_object(&self, tenant: Option<&str>, event: &ObjectWatchEvent) {
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(error = %err, "Failed to serialize object watch event");
                return;
            }
        };
        let targets = watcher_ids(
            &self.obj_bucket_watchers,
            &(tenant.map(str::to_string), event.bucket.clone()),
        );
        self.send_frame(&targets, &frame, None);
    }

    fn send_frame(&self, targets: &[u64], frame: &str, revision: Option<i64>) {
        let mut dead = Vec::new();
        for id in targets {
            let Some(sub) = self.subscriptions.get(id) else {
                continue;
            };
            // Events at or below the subscriber's starting revision were
            // already seen (or covered by replay).
            if let Some(revision) = revision {
                if revision <= sub.since {
                    continue;
                }
            }
            match sub.tx.try_send(frame.to_string()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(session = id, "Watch subscriber too slow, disconnecting");
                    dead.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
            }
        }
        for id in dead {
            self.unsubscribe(id);
        }
    }

    // ==================== Stats ====================

    pub fn active_watchers(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn watched_kv_buckets(&self) -> usize {
        self.kv_bucket_watchers.len()
    }

    pub fn watched_kv_keys(&self) -> usize {
        self.kv_key_watchers.len()
    }
}

fn remove_watcher<K: std::hash::Hash + Eq>(map: &DashMap<K, HashSet<u64>>, key: K, id: u64) {
    if let Some(mut entry) = map.get_mut(&key) {
        entry.remove(&id);
        let empty = entry.is_empty();
        drop(entry);
        if empty {
            map.remove_if(&key, |_, ids| ids.is_empty());
        }
    }
}

fn watcher_ids<K: std::hash::Hash + Eq>(map: &DashMap<K, HashSet<u64>>, key: &K) -> Vec<u64> {
    map.get(key)
        .map(|ids| ids.iter().copied().collect())
        .unwrap_or_default()
}
