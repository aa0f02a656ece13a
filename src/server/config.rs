//! CLI arguments and server configuration.
//!
//! Every knob is also bound to an environment variable so containerized
//! deployments can configure the service without flags.

use clap::Parser;

use crate::config::{Config, DbConfig, KvConfig, ObjectBackend, ObjectConfig};

/// Server-specific settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

/// Command line arguments for the Depot server.
#[derive(Debug, Parser)]
#[command(name = "depot", about = "Unified KV and object store backed by PostgreSQL")]
pub struct CliArgs {
    /// HTTP listen port.
    #[arg(long, env = "SERVER_PORT", default_value_t = 8080)]
    pub port: u16,

    /// PostgreSQL host.
    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    pub db_host: String,

    /// PostgreSQL port.
    #[arg(long, env = "DB_PORT", default_value_t = 5432)]
    pub db_port: u16,

    /// Database name.
    #[arg(long, env = "DB_NAME", default_value = "depot")]
    pub db_name: String,

    /// Database user.
    #[arg(long, env = "DB_USERNAME", default_value = "depot")]
    pub db_username: String,

    /// Database password.
    #[arg(long, env = "DB_PASSWORD", default_value = "")]
    pub db_password: String,

    /// Connection pool size; bounds in-flight requests.
    #[arg(long, env = "DB_POOL_SIZE", default_value_t = 16)]
    pub db_pool_size: u32,

    /// Default cap on KV value size in bytes.
    #[arg(long, env = "KV_MAX_VALUE_SIZE", default_value_t = 1_048_576)]
    pub kv_max_value_size: i32,

    /// Default per-key history window.
    #[arg(long, env = "KV_MAX_HISTORY_SIZE", default_value_t = 100)]
    pub kv_max_history_size: i32,

    /// Seconds between expiry sweeps.
    #[arg(long, env = "KV_CLEANUP_INTERVAL_SECONDS", default_value_t = 3600)]
    pub kv_cleanup_interval_seconds: u64,

    /// Default object chunk size in bytes.
    #[arg(long, env = "OBJECTSTORE_CHUNK_SIZE", default_value_t = 1_048_576)]
    pub objectstore_chunk_size: i32,

    /// Default cap on object size in bytes.
    #[arg(long, env = "OBJECTSTORE_MAX_OBJECT_SIZE", default_value_t = 1_073_741_824)]
    pub objectstore_max_object_size: i64,

    /// Object payload backend; only `postgres` is supported.
    #[arg(long, env = "OBJECTSTORE_BACKEND", default_value = "postgres")]
    pub objectstore_backend: ObjectBackend,
}

impl CliArgs {
    pub fn to_config(&self) -> Config {
        Config {
            db: DbConfig {
                host: self.db_host.clone(),
                port: self.db_port,
                database: self.db_name.clone(),
                username: self.db_username.clone(),
                password: self.db_password.clone(),
                pool_size: self.db_pool_size,
            },
            kv: KvConfig {
                max_value_size: self.kv_max_value_size,
                max_history_per_key: self.kv_max_history_size,
                cleanup_interval: std::time::Duration::from_secs(self.kv_cleanup_interval_seconds),
            },
            object: ObjectConfig {
                chunk_size: self.objectstore_chunk_size,
                max_object_size: self.objectstore_max_object_size,
                backend: self.objectstore_backend,
            },
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig { port: self.port }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_defaults() {
        // given/when
        let args = CliArgs::parse_from(["depot"]);

        // then
        assert_eq!(args.port, 8080);
        assert_eq!(args.db_port, 5432);
        assert_eq!(args.kv_max_value_size, 1_048_576);
        assert_eq!(args.objectstore_backend, ObjectBackend::Postgres);
    }

    #[test]
    fn should_reject_s3_backend_flag() {
        // given/when
        let result = CliArgs::try_parse_from(["depot", "--objectstore-backend", "s3"]);

        // then
        assert!(result.is_err());
    }

    #[test]
    fn should_build_config_from_args() {
        // given
        let args = CliArgs::parse_from([
            "depot",
            "--db-host",
            "db.internal",
            "--kv-cleanup-interval-seconds",
            "60",
        ]);

        // when
        let config = args.to_config();

        // then
        assert_eq!(config.db.host, "db.internal");
        assert_eq!(config.kv.cleanup_interval.as_secs(), 60);
    }
}
