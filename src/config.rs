//! Configuration for the Depot service.
//!
//! Defaults mirror the service's environment variables; the CLI layer in
//! `server::config` binds each field to its variable.

use std::str::FromStr;
use std::time::Duration;

/// PostgreSQL connection settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    /// Upper bound on pooled connections; this also bounds the number of
    /// in-flight requests.
    pub pool_size: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "depot".to_string(),
            username: "depot".to_string(),
            password: String::new(),
            pool_size: 16,
        }
    }
}

/// KV engine defaults, applied when a bucket is created without explicit
/// limits.
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// Default per-bucket cap on value size in bytes.
    pub max_value_size: i32,
    /// Default per-key history window.
    pub max_history_per_key: i32,
    /// Interval between expiry sweeps.
    pub cleanup_interval: Duration,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            max_value_size: 1_048_576,
            max_history_per_key: 100,
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

/// Object store defaults.
#[derive(Debug, Clone)]
pub struct ObjectConfig {
    /// Default chunk size for new buckets. Uploads buffer at most one chunk.
    pub chunk_size: i32,
    /// Default per-bucket cap on object size in bytes.
    pub max_object_size: i64,
    pub backend: ObjectBackend,
}

impl Default for ObjectConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_048_576,
            max_object_size: 1_073_741_824,
            backend: ObjectBackend::Postgres,
        }
    }
}

/// Storage backend for object payloads.
///
/// Selected once at startup; there is no runtime lookup. PostgreSQL is the
/// only backend this build ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectBackend {
    #[default]
    Postgres,
}

impl FromStr for ObjectBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgres" => Ok(ObjectBackend::Postgres),
            "s3" => Err("the s3 backend is not supported by this build".to_string()),
            other => Err(format!("unknown object store backend: {other}")),
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub db: DbConfig,
    pub kv: KvConfig,
    pub object: ObjectConfig,
}
