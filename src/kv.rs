//! Key-Value engine.
//!
//! Buckets namespace keys; every write to a key appends a new revision row.
//! Deletes append a tombstone, purges hard-remove all rows for a key, and a
//! TTL marks rows for the expiry sweeper. Concurrent writers to one key are
//! linearized by the revision counter row lock (see [`crate::sequence`]).
//!
//! Change notifications ride on row triggers: the engine itself never talks
//! to the watch registry. The one exception is purge, which has no single
//! row image and therefore emits an explicit notification from its
//! transaction.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::config::KvConfig;
use crate::error::{Error, Result};
use crate::model::{KvBucket, KvEntry, KvOperation};
use crate::sequence;
use crate::store::Store;

/// Parameters for creating a KV bucket. Unset limits fall back to the
/// service-wide defaults.
#[derive(Debug, Clone, Default)]
pub struct KvBucketSpec {
    pub name: String,
    pub description: Option<String>,
    pub max_value_size: Option<i32>,
    pub max_history_per_key: Option<i32>,
    pub ttl_seconds: Option<i64>,
}

/// Partial update of bucket settings; `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct KvBucketUpdate {
    pub description: Option<String>,
    pub max_value_size: Option<i32>,
    pub max_history_per_key: Option<i32>,
    pub ttl_seconds: Option<i64>,
}

/// Computes the expiry instant for a write.
///
/// A request-level TTL overrides the bucket default; an explicit 0 opts out
/// of the bucket default. An effective TTL of 0 or absent means no expiry.
fn effective_expiry(
    bucket_ttl: Option<i64>,
    request_ttl: Option<i64>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let ttl = request_ttl.or(bucket_ttl)?;
    if ttl <= 0 {
        return None;
    }
    Some(now + Duration::seconds(ttl))
}

/// The KV engine. Cheap to clone; all state lives in the database.
#[derive(Clone)]
pub struct KvStore {
    store: Store,
    config: KvConfig,
}

impl KvStore {
    pub fn new(store: Store, config: KvConfig) -> Self {
        Self { store, config }
    }

    // ==================== Bucket operations ====================

    pub async fn create_bucket(&self, tenant: Option<&str>, spec: KvBucketSpec) -> Result<KvBucket> {
        let mut tx = self.store.begin(tenant).await?;

        let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM kv_buckets WHERE name = $1")
            .bind(&spec.name)
            .fetch_optional(tx.conn())
            .await?;
        if exists.is_some() {
            return Err(Error::conflict(format!("Bucket already exists: {}", spec.name)));
        }

        let bucket: KvBucket = sqlx::query_as(
            r#"
            INSERT INTO kv_buckets (name, description, max_value_size, max_history_per_key, ttl_seconds)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(&spec.name)
        .bind(&spec.description)
        .bind(spec.max_value_size.unwrap_or(self.config.max_value_size))
        .bind(spec.max_history_per_key.unwrap_or(self.config.max_history_per_key))
        .bind(spec.ttl_seconds)
        .fetch_one(tx.conn())
        .await
        .map_err(|e| {
            Error::from(e).conflict_on_unique(format!("Bucket already exists: {}", spec.name))
        })?;
        tx.commit().await?;

        tracing::info!(bucket = %bucket.name, id = %bucket.id, "Created kv bucket");
        Ok(bucket)
    }

    pub async fn get_bucket(&self, tenant: Option<&str>, name: &str) -> Result<KvBucket> {
        let mut tx = self.store.begin(tenant).await?;
        let bucket = bucket_by_name(tx.conn(), name).await?;
        tx.commit().await?;
        Ok(bucket)
    }

    pub async fn list_buckets(&self, tenant: Option<&str>) -> Result<Vec<KvBucket>> {
        let mut tx = self.store.begin(tenant).await?;
        let buckets = sqlx::query_as("SELECT * FROM kv_buckets ORDER BY name")
            .fetch_all(tx.conn())
            .await?;
        tx.commit().await?;
        Ok(buckets)
    }

    pub async fn update_bucket(
        &self,
        tenant: Option<&str>,
        name: &str,
        update: KvBucketUpdate,
    ) -> Result<KvBucket> {
        let mut tx = self.store.begin(tenant).await?;
        let bucket: Option<KvBucket> = sqlx::query_as(
            r#"
            UPDATE kv_buckets
            SET description = COALESCE($2, description),
                max_value_size = COALESCE($3, max_value_size),
                max_history_per_key = COALESCE($4, max_history_per_key),
                ttl_seconds = COALESCE($5, ttl_seconds),
                updated_at = now()
            WHERE name = $1
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(&update.description)
        .bind(update.max_value_size)
        .bind(update.max_history_per_key)
        .bind(update.ttl_seconds)
        .fetch_optional(tx.conn())
        .await?;
        let bucket = bucket.ok_or_else(|| Error::not_found(format!("Bucket not found: {name}")))?;
        tx.commit().await?;

        tracing::info!(bucket = %bucket.name, "Updated kv bucket");
        Ok(bucket)
    }

    /// Deletes a bucket; entries and revision counters cascade with it.
    pub async fn delete_bucket(&self, tenant: Option<&str>, name: &str) -> Result<()> {
        let mut tx = self.store.begin(tenant).await?;
        let deleted: Option<Uuid> = sqlx::query_scalar("DELETE FROM kv_buckets WHERE name = $1 RETURNING id")
            .bind(name)
            .fetch_optional(tx.conn())
            .await?;
        if deleted.is_none() {
            return Err(Error::not_found(format!("Bucket not found: {name}")));
        }
        tx.commit().await?;

        tracing::info!(bucket = %name, "Deleted kv bucket");
        Ok(())
    }

    /// Hard-removes every entry in the bucket; the bucket itself remains.
    pub async fn purge_bucket(&self, tenant: Option<&str>, name: &str) -> Result<u64> {
        let mut tx = self.store.begin(tenant).await?;
        let bucket = bucket_by_name(tx.conn(), name).await?;
        let deleted = sqlx::query("DELETE FROM kv_entries WHERE bucket_id = $1")
            .bind(bucket.id)
            .execute(tx.conn())
            .await?
            .rows_affected();
        tx.commit().await?;

        tracing::info!(bucket = %name, deleted, "Purged kv bucket");
        Ok(deleted)
    }

    // ==================== Key operations ====================

    pub async fn list_keys(&self, tenant: Option<&str>, bucket: &str) -> Result<Vec<String>> {
        let mut tx = self.store.begin(tenant).await?;
        let bucket = bucket_by_name(tx.conn(), bucket).await?;
        let keys = sqlx::query_scalar(
            "SELECT DISTINCT key FROM kv_entries WHERE bucket_id = $1 ORDER BY key",
        )
        .bind(bucket.id)
        .fetch_all(tx.conn())
        .await?;
        tx.commit().await?;
        Ok(keys)
    }

    /// Appends a new revision for the key.
    pub async fn put(
        &self,
        tenant: Option<&str>,
        bucket: &str,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: Option<i64>,
    ) -> Result<KvEntry> {
        let mut tx = self.store.begin(tenant).await?;
        let bucket = bucket_by_name(tx.conn(), bucket).await?;
        check_value_size(&value, &bucket)?;

        let expires_at = effective_expiry(bucket.ttl_seconds, ttl_seconds, Utc::now());
        let revision = sequence::next_revision(tx.conn(), bucket.id, key).await?;
        let entry = insert_entry(
            tx.conn(),
            bucket.id,
            key,
            Some(&value),
            revision,
            KvOperation::Put,
            expires_at,
        )
        .await?;
        prune_history(tx.conn(), &bucket, key, revision).await?;
        tx.commit().await?;

        tracing::debug!(bucket = %bucket.name, key, revision, "Put kv entry");
        Ok(entry)
    }

    /// Conditional put: succeeds only if the latest revision matches
    /// `expected_revision` (0 means the key must not exist).
    pub async fn cas_put(
        &self,
        tenant: Option<&str>,
        bucket: &str,
        key: &str,
        value: Vec<u8>,
        expected_revision: i64,
        ttl_seconds: Option<i64>,
    ) -> Result<KvEntry> {
        let mut tx = self.store.begin(tenant).await?;
        let bucket = bucket_by_name(tx.conn(), bucket).await?;
        check_value_size(&value, &bucket)?;

        // Serialization point: concurrent writers to this key block here
        // until this transaction commits or rolls back.
        sequence::lock_key(tx.conn(), bucket.id, key).await?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(revision) FROM kv_entries WHERE bucket_id = $1 AND key = $2")
                .bind(bucket.id)
                .bind(key)
                .fetch_one(tx.conn())
                .await?;
        let current = current.unwrap_or(0);
        if current != expected_revision {
            return Err(Error::CasConflict {
                expected: expected_revision,
                current,
            });
        }

        let expires_at = effective_expiry(bucket.ttl_seconds, ttl_seconds, Utc::now());
        let revision = sequence::next_revision(tx.conn(), bucket.id, key).await?;
        let entry = insert_entry(
            tx.conn(),
            bucket.id,
            key,
            Some(&value),
            revision,
            KvOperation::Put,
            expires_at,
        )
        .await?;
        prune_history(tx.conn(), &bucket, key, revision).await?;
        tx.commit().await?;

        tracing::debug!(bucket = %bucket.name, key, revision, expected_revision, "CAS put");
        Ok(entry)
    }

    /// Latest value for the key. Tombstoned and expired keys read as absent;
    /// expired rows stay in history until the sweeper removes them.
    pub async fn get(&self, tenant: Option<&str>, bucket: &str, key: &str) -> Result<KvEntry> {
        let mut tx = self.store.begin(tenant).await?;
        let bucket = bucket_by_name(tx.conn(), bucket).await?;
        let entry = latest_entry(tx.conn(), bucket.id, key).await?;
        tx.commit().await?;

        let entry =
            entry.ok_or_else(|| Error::not_found(format!("Key not found: {}/{key}", bucket.name)))?;
        if entry.operation == KvOperation::Delete {
            return Err(Error::not_found(format!("Key deleted: {}/{key}", bucket.name)));
        }
        if entry.is_expired(Utc::now()) {
            return Err(Error::not_found(format!("Key not found: {}/{key}", bucket.name)));
        }
        Ok(entry)
    }

    /// Exact revision lookup. Tombstones and expired rows are returned as-is
    /// for history fidelity.
    pub async fn get_revision(
        &self,
        tenant: Option<&str>,
        bucket: &str,
        key: &str,
        revision: i64,
    ) -> Result<KvEntry> {
        let mut tx = self.store.begin(tenant).await?;
        let bucket = bucket_by_name(tx.conn(), bucket).await?;
        let entry: Option<KvEntry> = sqlx::query_as(
            "SELECT * FROM kv_entries WHERE bucket_id = $1 AND key = $2 AND revision = $3",
        )
        .bind(bucket.id)
        .bind(key)
        .bind(revision)
        .fetch_optional(tx.conn())
        .await?;
        tx.commit().await?;

        entry.ok_or_else(|| {
            Error::not_found(format!("Revision not found: {}/{key}@{revision}", bucket.name))
        })
    }

    /// Revision history, newest first, including tombstones.
    pub async fn history(
        &self,
        tenant: Option<&str>,
        bucket: &str,
        key: &str,
        limit: Option<i64>,
    ) -> Result<Vec<KvEntry>> {
        let mut tx = self.store.begin(tenant).await?;
        let bucket = bucket_by_name(tx.conn(), bucket).await?;
        // A window of 0 means unlimited history; LIMIT NULL reads it all.
        let limit: Option<i64> = limit
            .filter(|l| *l > 0)
            .or(Some(bucket.max_history_per_key as i64))
            .filter(|l| *l > 0);
        let entries = sqlx::query_as(
            r#"
            SELECT * FROM kv_entries
            WHERE bucket_id = $1 AND key = $2
            ORDER BY revision DESC
            LIMIT $3
            "#,
        )
        .bind(bucket.id)
        .bind(key)
        .bind(limit)
        .fetch_all(tx.conn())
        .await?;
        tx.commit().await?;
        Ok(entries)
    }

    /// Appends a tombstone. Prior history is preserved (subject to the
    /// normal history window).
    pub async fn delete(&self, tenant: Option<&str>, bucket: &str, key: &str) -> Result<KvEntry> {
        let mut tx = self.store.begin(tenant).await?;
        let bucket = bucket_by_name(tx.conn(), bucket).await?;

        // Take the key lock before inspecting the latest revision so two
        // concurrent deletes cannot both append a tombstone.
        sequence::lock_key(tx.conn(), bucket.id, key).await?;
        let latest = latest_entry(tx.conn(), bucket.id, key).await?;
        match latest {
            None => {
                return Err(Error::not_found(format!("Key not found: {}/{key}", bucket.name)))
            }
            Some(entry) if entry.operation == KvOperation::Delete => {
                return Err(Error::not_found(format!("Key deleted: {}/{key}", bucket.name)))
            }
            Some(_) => {}
        }

        let revision = sequence::next_revision(tx.conn(), bucket.id, key).await?;
        let entry = insert_entry(
            tx.conn(),
            bucket.id,
            key,
            None,
            revision,
            KvOperation::Delete,
            None,
        )
        .await?;
        prune_history(tx.conn(), &bucket, key, revision).await?;
        tx.commit().await?;

        tracing::debug!(bucket = %bucket.name, key, revision, "Deleted kv entry");
        Ok(entry)
    }

    /// Hard-removes every revision of the key, tombstones included. The
    /// revision counter is retained so later writes continue numbering.
    pub async fn purge_key(&self, tenant: Option<&str>, bucket: &str, key: &str) -> Result<u64> {
        let mut tx = self.store.begin(tenant).await?;
        let bucket = bucket_by_name(tx.conn(), bucket).await?;
        let deleted = sqlx::query("DELETE FROM kv_entries WHERE bucket_id = $1 AND key = $2")
            .bind(bucket.id)
            .bind(key)
            .execute(tx.conn())
            .await?
            .rows_affected();

        // Row deletions are not broadcast; a purge announces itself once.
        let payload = serde_json::json!({
            "table": "kv_entries",
            "action": "PURGE",
            "old": {
                "bucket_id": bucket.id,
                "bucket_name": bucket.name,
                "tenant": bucket.tenant,
                "key": key,
                "created_at": Utc::now(),
            },
        });
        sqlx::query("SELECT pg_notify('store_changes', $1)")
            .bind(payload.to_string())
            .execute(tx.conn())
            .await?;
        tx.commit().await?;

        tracing::info!(bucket = %bucket.name, key, deleted, "Purged kv key");
        Ok(deleted)
    }
}

async fn bucket_by_name(conn: &mut PgConnection, name: &str) -> Result<KvBucket> {
    let bucket: Option<KvBucket> = sqlx::query_as("SELECT * FROM kv_buckets WHERE name = $1")
        .bind(name)
        .fetch_optional(conn)
        .await?;
    bucket.ok_or_else(|| Error::not_found(format!("Bucket not found: {name}")))
}

fn check_value_size(value: &[u8], bucket: &KvBucket) -> Result<()> {
    if value.len() > bucket.max_value_size as usize {
        return Err(Error::validation(format!(
            "Value size ({} bytes) exceeds maximum ({} bytes)",
            value.len(),
            bucket.max_value_size
        )));
    }
    Ok(())
}

async fn latest_entry(
    conn: &mut PgConnection,
    bucket_id: Uuid,
    key: &str,
) -> Result<Option<KvEntry>> {
    let entry = sqlx::query_as(
        r#"
        SELECT * FROM kv_entries
        WHERE bucket_id = $1 AND key = $2
        ORDER BY revision DESC
        LIMIT 1
        "#,
    )
    .bind(bucket_id)
    .bind(key)
    .fetch_optional(conn)
    .await?;
    Ok(entry)
}

async fn insert_entry(
    conn: &mut PgConnection,
    bucket_id: Uuid,
    key: &str,
    value: Option<&[u8]>,
    revision: i64,
    operation: KvOperation,
    expires_at: Option<DateTime<Utc>>,
) -> Result<KvEntry> {
    let entry = sqlx::query_as(
        r#"
        INSERT INTO kv_entries (bucket_id, key, value, revision, operation, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(bucket_id)
    .bind(key)
    .bind(value)
    .bind(revision)
    .bind(operation.as_str())
    .bind(expires_at)
    .fetch_one(conn)
    .await?;
    Ok(entry)
}

/// Drops revisions that fell out of the bucket's history window. A window of
/// 0 or less disables pruning.
async fn prune_history(
    conn: &mut PgConnection,
    bucket: &KvBucket,
    key: &str,
    latest_revision: i64,
) -> Result<()> {
    if bucket.max_history_per_key <= 0 {
        return Ok(());
    }
    sqlx::query("DELETE FROM kv_entries WHERE bucket_id = $1 AND key = $2 AND revision <= $3")
        .bind(bucket.id)
        .bind(key)
        .bind(latest_revision - bucket.max_history_per_key as i64)
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket_with_limits(max_value_size: i32) -> KvBucket {
        KvBucket {
            id: Uuid::new_v4(),
            tenant: None,
            name: "b".to_string(),
            description: None,
            max_value_size,
            max_history_per_key: 100,
            ttl_seconds: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn should_use_request_ttl_over_bucket_default() {
        // given
        let now = Utc::now();

        // when
        let expiry = effective_expiry(Some(3600), Some(60), now);

        // then
        assert_eq!(expiry, Some(now + Duration::seconds(60)));
    }

    #[test]
    fn should_fall_back_to_bucket_ttl() {
        // given
        let now = Utc::now();

        // when
        let expiry = effective_expiry(Some(3600), None, now);

        // then
        assert_eq!(expiry, Some(now + Duration::seconds(3600)));
    }

    #[test]
    fn should_treat_zero_ttl_as_no_expiry() {
        // given
        let now = Utc::now();

        // when - an explicit 0 opts out of the bucket default
        let expiry = effective_expiry(Some(3600), Some(0), now);

        // then
        assert_eq!(expiry, None);
    }

    #[test]
    fn should_have_no_expiry_without_any_ttl() {
        // given/when/then
        assert_eq!(effective_expiry(None, None, Utc::now()), None);
    }

    #[test]
    fn should_accept_value_at_size_limit() {
        // given
        let bucket = bucket_with_limits(8);

        // when/then
        assert!(check_value_size(&[0u8; 8], &bucket).is_ok());
    }

    #[test]
    fn should_reject_oversized_value() {
        // given
        let bucket = bucket_with_limits(8);

        // when
        let err = check_value_size(&[0u8; 9], &bucket).unwrap_err();

        // then
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("exceeds maximum"));
    }
}
