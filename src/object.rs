//! Object store engine: chunked, content-addressed storage.
//!
//! Uploads run in three phases so memory stays bounded at one chunk plus the
//! current input run:
//!
//! 1. **Begin** - replace any prior object of the same name, then insert an
//!    `UPLOADING` metadata row in its own transaction.
//! 2. **Stream** - split the body into chunks; each full chunk is written in
//!    its own transaction: the shared chunk insert is skipped when a row with
//!    that digest already exists (that is the dedup), then a link row records
//!    the chunk's position.
//! 3. **Finalize** - flush the leftover chunk and flip the metadata to
//!    `COMPLETED` with the final size, count, and digest.
//!
//! Any failure in phases 2-3 marks the metadata `FAILED` in a compensating
//! transaction; written chunks and links stay behind for a later reap.
//! Readers only ever see `COMPLETED` metadata.

use std::collections::HashMap;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::chunker::{digest_hex, Chunker, DIGEST_ALGORITHM};
use crate::config::ObjectConfig;
use crate::error::{Error, Result};
use crate::model::{ObjBucket, ObjMetadata, ObjectStatus};
use crate::range::chunk_window;
use crate::store::Store;

/// Parameters for creating an object bucket.
#[derive(Debug, Clone, Default)]
pub struct ObjBucketSpec {
    pub name: String,
    pub description: Option<String>,
    pub chunk_size: Option<i32>,
    pub max_object_size: Option<i64>,
}

/// Partial update of object bucket settings.
#[derive(Debug, Clone, Default)]
pub struct ObjBucketUpdate {
    pub description: Option<String>,
    pub chunk_size: Option<i32>,
    pub max_object_size: Option<i64>,
}

/// Caller-supplied attributes for an upload.
#[derive(Debug, Clone, Default)]
pub struct UploadAttrs {
    pub content_type: Option<String>,
    pub description: Option<String>,
    pub headers: HashMap<String, String>,
}

/// Outcome of an integrity check.
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub valid: bool,
    pub message: String,
}

/// The object engine. Cheap to clone; all state lives in the database.
#[derive(Clone)]
pub struct ObjectStore {
    store: Store,
    config: ObjectConfig,
}

impl ObjectStore {
    pub fn new(store: Store, config: ObjectConfig) -> Self {
        Self { store, config }
    }

    // ==================== Bucket operations ====================

    pub async fn create_bucket(
        &self,
        tenant: Option<&str>,
        spec: ObjBucketSpec,
    ) -> Result<ObjBucket> {
        if spec.chunk_size.is_some_and(|size| size <= 0) {
            return Err(Error::validation("Chunk size must be positive"));
        }
        if spec.max_object_size.is_some_and(|size| size <= 0) {
            return Err(Error::validation("Max object size must be positive"));
        }
        let mut tx = self.store.begin(tenant).await?;

        let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM obj_buckets WHERE name = $1")
            .bind(&spec.name)
            .fetch_optional(tx.conn())
            .await?;
        if exists.is_some() {
            return Err(Error::conflict(format!(
                "Object bucket already exists: {}",
                spec.name
            )));
        }

        let bucket: ObjBucket = sqlx::query_as(
            r#"
            INSERT INTO obj_buckets (name, description, chunk_size, max_object_size)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(&spec.name)
        .bind(&spec.description)
        .bind(spec.chunk_size.unwrap_or(self.config.chunk_size))
        .bind(spec.max_object_size.unwrap_or(self.config.max_object_size))
        .fetch_one(tx.conn())
        .await
        .map_err(|e| {
            Error::from(e).conflict_on_unique(format!("Object bucket already exists: {}", spec.name))
        })?;
        tx.commit().await?;

        tracing::info!(bucket = %bucket.name, id = %bucket.id, "Created object bucket");
        Ok(bucket)
    }

    pub async fn get_bucket(&self, tenant: Option<&str>, name: &str) -> Result<ObjBucket> {
        let mut tx = self.store.begin(tenant).await?;
        let bucket = bucket_by_name(tx.conn(), name).await?;
        tx.commit().await?;
        Ok(bucket)
    }

    pub async fn list_buckets(&self, tenant: Option<&str>) -> Result<Vec<ObjBucket>> {
        let mut tx = self.store.begin(tenant).await?;
        let buckets = sqlx::query_as("SELECT * FROM obj_buckets ORDER BY name")
            .fetch_all(tx.conn())
            .await?;
        tx.commit().await?;
        Ok(buckets)
    }

    pub async fn update_bucket(
        &self,
        tenant: Option<&str>,
        name: &str,
        update: ObjBucketUpdate,
    ) -> Result<ObjBucket> {
        if update.chunk_size.is_some_and(|size| size <= 0) {
            return Err(Error::validation("Chunk size must be positive"));
        }
        if update.max_object_size.is_some_and(|size| size <= 0) {
            return Err(Error::validation("Max object size must be positive"));
        }
        let mut tx = self.store.begin(tenant).await?;
        let bucket: Option<ObjBucket> = sqlx::query_as(
            r#"
            UPDATE obj_buckets
            SET description = COALESCE($2, description),
                chunk_size = COALESCE($3, chunk_size),
                max_object_size = COALESCE($4, max_object_size),
                updated_at = now()
            WHERE name = $1
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(&update.description)
        .bind(update.chunk_size)
        .bind(update.max_object_size)
        .fetch_optional(tx.conn())
        .await?;
        let bucket =
            bucket.ok_or_else(|| Error::not_found(format!("Object bucket not found: {name}")))?;
        tx.commit().await?;

        tracing::info!(bucket = %bucket.name, "Updated object bucket");
        Ok(bucket)
    }

    /// Deletes a bucket; metadata rows and chunk links cascade. Shared
    /// chunks are left in place for other referents.
    pub async fn delete_bucket(&self, tenant: Option<&str>, name: &str) -> Result<()> {
        let mut tx = self.store.begin(tenant).await?;
        let deleted: Option<Uuid> =
            sqlx::query_scalar("DELETE FROM obj_buckets WHERE name = $1 RETURNING id")
                .bind(name)
                .fetch_optional(tx.conn())
                .await?;
        if deleted.is_none() {
            return Err(Error::not_found(format!("Object bucket not found: {name}")));
        }
        tx.commit().await?;

        tracing::info!(bucket = %name, "Deleted object bucket");
        Ok(())
    }

    // ==================== Object operations ====================

    /// Streams an upload into chunked storage, replacing any existing object
    /// of the same name.
    pub async fn put_object<S, E>(
        &self,
        tenant: Option<&str>,
        bucket: &str,
        name: &str,
        attrs: UploadAttrs,
        stream: S,
    ) -> Result<ObjMetadata>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        // Phase 1: replace any prior object, then stake out an UPLOADING row.
        let mut tx = self.store.begin(tenant).await?;
        let bucket = bucket_by_name(tx.conn(), bucket).await?;
        sqlx::query("DELETE FROM obj_metadata WHERE bucket_id = $1 AND name = $2")
            .bind(bucket.id)
            .bind(name)
            .execute(tx.conn())
            .await?;
        tx.commit().await?;

        let mut tx = self.store.begin(tenant).await?;
        let metadata: ObjMetadata = sqlx::query_as(
            r#"
            INSERT INTO obj_metadata (bucket_id, name, digest_algorithm, content_type, description, headers)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(bucket.id)
        .bind(name)
        .bind(DIGEST_ALGORITHM)
        .bind(&attrs.content_type)
        .bind(&attrs.description)
        .bind(sqlx::types::Json(&attrs.headers))
        .fetch_one(tx.conn())
        .await
        .map_err(|e| {
            Error::from(e).conflict_on_unique(format!(
                "Concurrent upload in progress: {}/{name}",
                bucket.name
            ))
        })?;
        tx.commit().await?;

        // Phases 2-3 compensate on failure so the metadata never stays
        // UPLOADING forever.
        match self.stream_chunks(tenant, &bucket, &metadata, stream).await {
            Ok(completed) => {
                tracing::info!(
                    bucket = %bucket.name,
                    object = %name,
                    size = completed.size,
                    chunks = completed.chunk_count,
                    "Stored object"
                );
                Ok(completed)
            }
            Err(err) => {
                if let Err(mark) = self.mark_failed(tenant, metadata.id).await {
                    tracing::error!(error = %mark, "Failed to mark upload as FAILED");
                }
                Err(err)
            }
        }
    }

    async fn stream_chunks<S, E>(
        &self,
        tenant: Option<&str>,
        bucket: &ObjBucket,
        metadata: &ObjMetadata,
        mut stream: S,
    ) -> Result<ObjMetadata>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let mut chunker = Chunker::new(bucket.chunk_size as usize);
        let mut chunk_index: i32 = 0;

        // Phase 2: drain full chunks as the body arrives.
        while let Some(run) = stream.next().await {
            let run = run.map_err(|e| Error::validation(format!("upload stream error: {e}")))?;
            if chunker.total_bytes() + run.len() as u64 > bucket.max_object_size as u64 {
                return Err(Error::validation(format!(
                    "Object size exceeds maximum ({} bytes)",
                    bucket.max_object_size
                )));
            }
            for chunk in chunker.push(&run) {
                self.write_chunk(tenant, metadata.id, chunk_index, &chunk).await?;
                chunk_index += 1;
            }
        }

        // Phase 3: flush the final short chunk and complete the metadata.
        let total = chunker.total_bytes() as i64;
        let (leftover, digest) = chunker.finish();
        if let Some(chunk) = leftover {
            self.write_chunk(tenant, metadata.id, chunk_index, &chunk).await?;
            chunk_index += 1;
        }

        let mut tx = self.store.begin(tenant).await?;
        let completed: ObjMetadata = sqlx::query_as(
            r#"
            UPDATE obj_metadata
            SET size = $2, chunk_count = $3, digest = $4, status = 'COMPLETED', updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(metadata.id)
        .bind(total)
        .bind(chunk_index)
        .bind(&digest)
        .fetch_one(tx.conn())
        .await?;
        tx.commit().await?;
        Ok(completed)
    }

    /// Writes one chunk in its own transaction: shared chunk insert (skipped
    /// when the digest already exists) plus the position link.
    async fn write_chunk(
        &self,
        tenant: Option<&str>,
        metadata_id: Uuid,
        chunk_index: i32,
        data: &[u8],
    ) -> Result<()> {
        let digest = digest_hex(data);
        let mut tx = self.store.begin(tenant).await?;
        // Losers of a concurrent insert race on a popular digest fall
        // through to the link insert.
        sqlx::query(
            r#"
            INSERT INTO obj_shared_chunks (digest, data, size)
            VALUES ($1, $2, $3)
            ON CONFLICT (digest) DO NOTHING
            "#,
        )
        .bind(&digest)
        .bind(data)
        .bind(data.len() as i32)
        .execute(tx.conn())
        .await?;
        sqlx::query(
            "INSERT INTO obj_metadata_chunks (metadata_id, chunk_index, chunk_digest) VALUES ($1, $2, $3)",
        )
        .bind(metadata_id)
        .bind(chunk_index)
        .bind(&digest)
        .execute(tx.conn())
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mark_failed(&self, tenant: Option<&str>, metadata_id: Uuid) -> Result<()> {
        let mut tx = self.store.begin(tenant).await?;
        sqlx::query("UPDATE obj_metadata SET status = 'FAILED', updated_at = now() WHERE id = $1")
            .bind(metadata_id)
            .execute(tx.conn())
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Metadata for a completed object.
    pub async fn get_metadata(
        &self,
        tenant: Option<&str>,
        bucket: &str,
        name: &str,
    ) -> Result<ObjMetadata> {
        let mut tx = self.store.begin(tenant).await?;
        let bucket = bucket_by_name(tx.conn(), bucket).await?;
        let metadata = completed_metadata(tx.conn(), &bucket, name).await?;
        tx.commit().await?;
        Ok(metadata)
    }

    /// Completed objects in the bucket, by name.
    pub async fn list_objects(&self, tenant: Option<&str>, bucket: &str) -> Result<Vec<ObjMetadata>> {
        let mut tx = self.store.begin(tenant).await?;
        let bucket = bucket_by_name(tx.conn(), bucket).await?;
        let objects = sqlx::query_as(
            "SELECT * FROM obj_metadata WHERE bucket_id = $1 AND status = 'COMPLETED' ORDER BY name",
        )
        .bind(bucket.id)
        .fetch_all(tx.conn())
        .await?;
        tx.commit().await?;
        Ok(objects)
    }

    /// Reads `length` bytes starting at `offset`, stitched from the chunk
    /// window the range touches. `length` is clamped to the object size.
    pub async fn read_range(
        &self,
        tenant: Option<&str>,
        bucket: &str,
        name: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        let mut tx = self.store.begin(tenant).await?;
        let bucket = bucket_by_name(tx.conn(), bucket).await?;
        let metadata = completed_metadata(tx.conn(), &bucket, name).await?;

        let size = metadata.size as u64;
        if length == 0 {
            return Err(Error::validation("Invalid range request".to_string()));
        }
        if offset >= size {
            return Err(Error::validation("Invalid range request".to_string()));
        }
        let length = length.min(size - offset);

        let chunk_size = bucket.chunk_size as u64;
        let (start_chunk, end_chunk) = chunk_window(offset, length, chunk_size);
        let chunks: Vec<(i32, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT c.chunk_index, s.data
            FROM obj_metadata_chunks c
            JOIN obj_shared_chunks s ON s.digest = c.chunk_digest
            WHERE c.metadata_id = $1 AND c.chunk_index BETWEEN $2 AND $3
            ORDER BY c.chunk_index
            "#,
        )
        .bind(metadata.id)
        .bind(start_chunk)
        .bind(end_chunk)
        .fetch_all(tx.conn())
        .await?;
        tx.commit().await?;

        let mut out = Vec::with_capacity(length as usize);
        for (index, data) in chunks {
            let chunk_start = index as u64 * chunk_size;
            let chunk_end = chunk_start + data.len() as u64;
            let slice_start = offset.max(chunk_start);
            let slice_end = (offset + length).min(chunk_end);
            if slice_start < slice_end {
                let from = (slice_start - chunk_start) as usize;
                let to = (slice_end - chunk_start) as usize;
                out.extend_from_slice(&data[from..to]);
            }
        }
        Ok(out)
    }

    /// Reads the whole object.
    pub async fn read_all(&self, tenant: Option<&str>, bucket: &str, name: &str) -> Result<Vec<u8>> {
        let metadata = self.get_metadata(tenant, bucket, name).await?;
        if metadata.size == 0 {
            return Ok(Vec::new());
        }
        self.read_range(tenant, bucket, name, 0, metadata.size as u64).await
    }

    /// Recomputes the object digest over its chunks, in link order, and
    /// compares with the stored digest.
    pub async fn verify(
        &self,
        tenant: Option<&str>,
        bucket: &str,
        name: &str,
    ) -> Result<IntegrityReport> {
        let mut tx = self.store.begin(tenant).await?;
        let bucket = bucket_by_name(tx.conn(), bucket).await?;
        let metadata = completed_metadata(tx.conn(), &bucket, name).await?;

        let chunks: Vec<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT s.data
            FROM obj_metadata_chunks c
            JOIN obj_shared_chunks s ON s.digest = c.chunk_digest
            WHERE c.metadata_id = $1
            ORDER BY c.chunk_index
            "#,
        )
        .bind(metadata.id)
        .fetch_all(tx.conn())
        .await?;
        tx.commit().await?;

        let mut hasher = Sha256::new();
        for data in &chunks {
            hasher.update(data);
        }
        let computed = hex::encode(hasher.finalize());
        let valid = metadata.digest.as_deref() == Some(computed.as_str());
        if !valid {
            tracing::warn!(
                bucket = %bucket.name,
                object = %name,
                expected = metadata.digest.as_deref().unwrap_or(""),
                computed = %computed,
                "Integrity check failed"
            );
        }
        Ok(IntegrityReport {
            valid,
            message: if valid {
                "Object integrity verified".to_string()
            } else {
                "Object integrity check failed".to_string()
            },
        })
    }

    /// Deletes an object's metadata and chunk links. Shared chunks are kept
    /// for other referents.
    pub async fn delete_object(&self, tenant: Option<&str>, bucket: &str, name: &str) -> Result<()> {
        let mut tx = self.store.begin(tenant).await?;
        let bucket = bucket_by_name(tx.conn(), bucket).await?;
        let deleted: Option<Uuid> = sqlx::query_scalar(
            "DELETE FROM obj_metadata WHERE bucket_id = $1 AND name = $2 AND status = 'COMPLETED' RETURNING id",
        )
        .bind(bucket.id)
        .bind(name)
        .fetch_optional(tx.conn())
        .await?;
        if deleted.is_none() {
            return Err(Error::not_found(format!(
                "Object not found: {}/{name}",
                bucket.name
            )));
        }
        tx.commit().await?;

        tracing::info!(bucket = %bucket.name, object = %name, "Deleted object");
        Ok(())
    }
}

async fn bucket_by_name(conn: &mut PgConnection, name: &str) -> Result<ObjBucket> {
    let bucket: Option<ObjBucket> = sqlx::query_as("SELECT * FROM obj_buckets WHERE name = $1")
        .bind(name)
        .fetch_optional(conn)
        .await?;
    bucket.ok_or_else(|| Error::not_found(format!("Object bucket not found: {name}")))
}

async fn completed_metadata(
    conn: &mut PgConnection,
    bucket: &ObjBucket,
    name: &str,
) -> Result<ObjMetadata> {
    let metadata: Option<ObjMetadata> = sqlx::query_as(
        "SELECT * FROM obj_metadata WHERE bucket_id = $1 AND name = $2 AND status = $3",
    )
    .bind(bucket.id)
    .bind(name)
    .bind(ObjectStatus::Completed.as_str())
    .fetch_optional(conn)
    .await?;
    metadata.ok_or_else(|| Error::not_found(format!("Object not found: {}/{name}", bucket.name)))
}
