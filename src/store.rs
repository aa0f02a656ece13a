//! PostgreSQL access layer: pool setup, embedded migrations, and
//! tenant-bound transactions.
//!
//! Every operation that touches tenant-scoped tables runs inside a
//! transaction whose first statement binds the tenant via
//! `set_config('app.current_tenant', ..., true)`. The setting is
//! transaction-local, so a rolled-back or committed transaction leaves the
//! pooled connection clean.

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

use crate::config::DbConfig;
use crate::error::Result;

/// PostgreSQL schema (embedded, executed statement-by-statement).
const SCHEMA: &str = include_str!("schema.sql");

/// Dollar-quote tag used by every function body in the embedded schema.
const BODY_TAG: &str = "$fn$";

fn has_sql(candidate: &str) -> bool {
    candidate.lines().any(|line| {
        let line = line.trim();
        !line.is_empty() && !line.starts_with("--")
    })
}

fn schema_statements(schema: &str) -> Vec<&str> {
    // Function bodies are $fn$-quoted and contain semicolons of their own;
    // only split on ';' outside a body.
    let mut statements = Vec::new();
    let mut start = 0;
    let mut in_body = false;
    let mut i = 0;
    let bytes = schema.as_bytes();
    while i < bytes.len() {
        if schema[i..].starts_with(BODY_TAG) {
            in_body = !in_body;
            i += BODY_TAG.len();
            continue;
        }
        if !in_body && bytes[i] == b';' {
            let candidate = schema[start..i].trim();
            if has_sql(candidate) {
                statements.push(candidate);
            }
            start = i + 1;
        }
        i += 1;
    }
    let tail = schema[start..].trim();
    if has_sql(tail) {
        statements.push(tail);
    }
    statements
}

/// Shared database handle.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connects a pool using the given settings.
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let opts = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.username)
            .password(&config.password);

        tracing::info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            username = %config.username,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect_with(opts)
            .await?;

        Ok(Self { pool })
    }

    /// Wraps an existing pool (tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the embedded schema. Statements are idempotent, so this is
    /// safe to run on every startup.
    pub async fn migrate(&self) -> Result<()> {
        for statement in schema_statements(SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("Schema migration complete");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Begins a transaction bound to the given tenant.
    ///
    /// An empty tenant string is treated as absent; the RLS policies
    /// normalize with `NULLIF(..., '')` on their side.
    pub async fn begin(&self, tenant: Option<&str>) -> Result<TenantTx> {
        let mut tx = self.pool.begin().await?;
        sqlx::query_scalar::<_, String>("SELECT set_config('app.current_tenant', $1, true)")
            .bind(tenant.unwrap_or(""))
            .fetch_one(&mut *tx)
            .await?;
        Ok(TenantTx { tx })
    }
}

/// A transaction with the tenant context applied.
///
/// Dropping without [`commit`](TenantTx::commit) rolls back, which also
/// clears the transaction-local tenant setting.
pub struct TenantTx {
    tx: Transaction<'static, Postgres>,
}

impl TenantTx {
    /// The underlying connection, for running queries.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_split_schema_into_statements() {
        // given
        let schema = "-- comment only\n;\nCREATE TABLE a (id INT);\nCREATE TABLE b (id INT);\n";

        // when
        let statements = schema_statements(schema);

        // then
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE a"));
        assert!(statements[1].starts_with("CREATE TABLE b"));
    }

    #[test]
    fn should_keep_function_bodies_whole() {
        // given - semicolons inside a $fn$-quoted body
        let schema = "CREATE FUNCTION f() RETURNS trigger AS $fn$\nBEGIN\n  NEW.tenant := 'x';\n  RETURN NEW;\nEND;\n$fn$ LANGUAGE plpgsql;\nCREATE TABLE t (id INT);\n";

        // when
        let statements = schema_statements(schema);

        // then
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("RETURN NEW;"));
        assert!(statements[1].starts_with("CREATE TABLE t"));
    }

    #[test]
    fn should_parse_embedded_schema() {
        // given/when
        let statements = schema_statements(SCHEMA);

        // then - every core table appears exactly once
        for table in [
            "kv_buckets",
            "kv_entries",
            "kv_revision_sequences",
            "obj_buckets",
            "obj_metadata",
            "obj_shared_chunks",
            "obj_metadata_chunks",
            "audit_log",
        ] {
            let creates = statements
                .iter()
                .filter(|s| s.starts_with(&format!("CREATE TABLE IF NOT EXISTS {table} ")))
                .count();
            assert_eq!(creates, 1, "expected one CREATE TABLE for {table}");
        }
    }
}
