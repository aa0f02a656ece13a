//! Per-key revision allocation.
//!
//! Each `(bucket, key)` has a counter row in `kv_revision_sequences`. The
//! upsert's row lock is the per-key critical section: two writers to the
//! same key serialize on it, so commit order implies revision order. No
//! application-level lock exists.
//!
//! The counter survives a key purge, so a purged key resumes numbering where
//! it left off instead of silently restarting at revision 1.

use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::Result;

/// Allocates the next revision for a key, taking the counter row lock.
pub async fn next_revision(conn: &mut PgConnection, bucket_id: Uuid, key: &str) -> Result<i64> {
    let revision = sqlx::query_scalar(
        r#"
        INSERT INTO kv_revision_sequences (bucket_id, key, current_revision)
        VALUES ($1, $2, 1)
        ON CONFLICT (bucket_id, key) DO UPDATE
        SET current_revision = kv_revision_sequences.current_revision + 1
        RETURNING current_revision
        "#,
    )
    .bind(bucket_id)
    .bind(key)
    .fetch_one(conn)
    .await?;
    Ok(revision)
}

/// Takes the counter row lock without advancing it.
///
/// This is the serialization point for compare-and-swap: once the lock is
/// held, no concurrent Put or CAS on the same key can commit first, so the
/// subsequent max-revision read is authoritative until this transaction
/// ends.
pub async fn lock_key(conn: &mut PgConnection, bucket_id: Uuid, key: &str) -> Result<i64> {
    let revision = sqlx::query_scalar(
        r#"
        INSERT INTO kv_revision_sequences (bucket_id, key, current_revision)
        VALUES ($1, $2, 0)
        ON CONFLICT (bucket_id, key) DO UPDATE
        SET current_revision = kv_revision_sequences.current_revision
        RETURNING current_revision
        "#,
    )
    .bind(bucket_id)
    .bind(key)
    .fetch_one(conn)
    .await?;
    Ok(revision)
}
