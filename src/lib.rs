//! Depot - a unified key-value and object store backed by PostgreSQL.
//!
//! Depot keeps both kinds of data in one relational database and exposes
//! them over HTTP/JSON with WebSocket change feeds. The semantics follow
//! stream-store conventions: bucketed namespaces, per-key revision history
//! with tombstones, TTL expiry, optimistic compare-and-swap, and chunked
//! large-object storage with content-addressed deduplication.
//!
//! # Architecture
//!
//! Four pieces share the database session and tenant context:
//!
//! - **[`KvStore`]**: revisioned key-value entries. Writers to one key are
//!   linearized by a per-key counter row lock; CAS rides the same lock.
//! - **[`ObjectStore`]**: a three-phase streaming chunk pipeline. Chunks are
//!   addressed by digest and shared across objects (and tenants).
//! - **Watch**: row triggers publish change payloads on a single
//!   LISTEN/NOTIFY channel; one listener connection fans events out to
//!   bucket- and key-scoped WebSocket subscribers.
//! - **Tenancy**: every operation binds `app.current_tenant` on its
//!   transaction; forced row-level security policies scope all reads and
//!   writes.
//!
//! # Example
//!
//! ```ignore
//! use depot::{Config, KvStore, Store};
//!
//! let store = Store::connect(&config.db).await?;
//! store.migrate().await?;
//! let kv = KvStore::new(store.clone(), config.kv.clone());
//!
//! let bucket = kv.create_bucket(None, spec).await?;
//! let entry = kv.put(None, "settings", "greeting", b"hello".to_vec(), None).await?;
//! assert_eq!(entry.revision, 1);
//! ```

mod chunker;
mod config;
mod error;
mod kv;
mod listener;
mod model;
mod object;
pub mod range;
mod sequence;
mod store;
mod sweeper;
mod watch;

pub mod server;

pub use chunker::{digest_hex, Chunker, DIGEST_ALGORITHM};
pub use config::{Config, DbConfig, KvConfig, ObjectBackend, ObjectConfig};
pub use error::{Error, Result};
pub use kv::{KvBucketSpec, KvBucketUpdate, KvStore};
pub use listener::ChangeListener;
pub use model::{KvBucket, KvEntry, KvOperation, ObjBucket, ObjMetadata, ObjectStatus};
pub use object::{IntegrityReport, ObjBucketSpec, ObjBucketUpdate, ObjectStore, UploadAttrs};
pub use store::Store;
pub use sweeper::{sweep_expired, Sweeper};
pub use watch::{KvWatchEvent, ObjectWatchEvent, WatchRegistry};
