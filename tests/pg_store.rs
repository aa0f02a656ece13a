#![cfg(feature = "pg-tests")]
//! Integration tests against a live PostgreSQL.
//!
//! Run with `cargo test --features pg-tests` and a `DATABASE_URL` pointing
//! at a scratch database; the schema is applied on first use. Buckets are
//! uniquely named so tests can re-run against the same database.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream;
use uuid::Uuid;

use depot::{
    digest_hex, range, sweep_expired, ChangeListener, Config, Error, KvBucketSpec, KvOperation,
    KvStore, ObjBucketSpec, ObjectStore, Store, UploadAttrs, WatchRegistry,
};

async fn setup() -> (Store, KvStore, ObjectStore) {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a scratch database");
    let pool = sqlx::PgPool::connect(&url).await.expect("connect");
    let store = Store::from_pool(pool);
    store.migrate().await.expect("migrate");
    let config = Config::default();
    (
        store.clone(),
        KvStore::new(store.clone(), config.kv),
        ObjectStore::new(store, config.object),
    )
}

fn unique(name: &str) -> String {
    format!("{name}-{}", Uuid::new_v4().simple())
}

fn body_stream(data: Vec<u8>) -> impl futures::Stream<Item = Result<Bytes, Infallible>> + Unpin {
    stream::iter(vec![Ok(Bytes::from(data))])
}

/// Deterministic filler that does not repeat with a short period.
fn pattern_bytes(len: usize) -> Vec<u8> {
    let mut state = 0x2545F491u32;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 24) as u8
        })
        .collect()
}

#[tokio::test]
async fn should_run_kv_basic_lifecycle() {
    // given
    let (_, kv, _) = setup().await;
    let bucket = unique("lifecycle");
    kv.create_bucket(
        None,
        KvBucketSpec {
            name: bucket.clone(),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // when - two puts
    let first = kv
        .put(None, &bucket, "k", b"Hello, World!".to_vec(), None)
        .await
        .unwrap();
    let second = kv
        .put(None, &bucket, "k", b"Updated value".to_vec(), None)
        .await
        .unwrap();

    // then
    assert_eq!(first.revision, 1);
    assert_eq!(second.revision, 2);

    // when - history
    let history = kv.history(None, &bucket, "k", Some(10)).await.unwrap();

    // then - newest first
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].revision, 2);
    assert_eq!(history[0].operation, KvOperation::Put);
    assert_eq!(history[1].revision, 1);

    // when - delete appends a tombstone
    let tombstone = kv.delete(None, &bucket, "k").await.unwrap();

    // then
    assert_eq!(tombstone.revision, 3);
    assert_eq!(tombstone.operation, KvOperation::Delete);
    assert!(tombstone.value.is_none());
    assert!(matches!(
        kv.get(None, &bucket, "k").await,
        Err(Error::NotFound(_))
    ));

    // when - revision 1 is still readable
    let pinned = kv.get_revision(None, &bucket, "k", 1).await.unwrap();

    // then
    assert_eq!(pinned.value.as_deref(), Some(&b"Hello, World!"[..]));

    // and - history keeps all prior puts plus the trailing tombstone
    let history = kv.history(None, &bucket, "k", Some(10)).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].operation, KvOperation::Delete);
}

#[tokio::test]
async fn should_let_exactly_one_concurrent_cas_win() {
    // given
    let (_, kv, _) = setup().await;
    let bucket = unique("cas");
    kv.create_bucket(
        None,
        KvBucketSpec {
            name: bucket.clone(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    kv.put(None, &bucket, "k", b"v0".to_vec(), None).await.unwrap();

    // when - two CAS writers race with the same expected revision
    let (a, b) = tokio::join!(
        kv.cas_put(None, &bucket, "k", b"a".to_vec(), 1, None),
        kv.cas_put(None, &bucket, "k", b"b".to_vec(), 1, None),
    );

    // then - exactly one wins with revision 2
    let (winner, loser) = match (&a, &b) {
        (Ok(_), Err(_)) => (a.unwrap(), b.unwrap_err()),
        (Err(_), Ok(_)) => (b.unwrap(), a.unwrap_err()),
        other => panic!("expected exactly one winner, got {other:?}"),
    };
    assert_eq!(winner.revision, 2);
    assert!(matches!(loser, Error::CasConflict { expected: 1, current: 2 }));

    // and - the stored value is the winner's
    let current = kv.get(None, &bucket, "k").await.unwrap();
    assert_eq!(current.value, winner.value);
}

#[tokio::test]
async fn should_fail_cas_on_missing_key_unless_expected_zero() {
    // given
    let (_, kv, _) = setup().await;
    let bucket = unique("cas-zero");
    kv.create_bucket(
        None,
        KvBucketSpec {
            name: bucket.clone(),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // when/then - expected 0 creates the key
    let created = kv
        .cas_put(None, &bucket, "fresh", b"v".to_vec(), 0, None)
        .await
        .unwrap();
    assert_eq!(created.revision, 1);

    // when/then - expected 0 on an existing key conflicts
    assert!(matches!(
        kv.cas_put(None, &bucket, "fresh", b"w".to_vec(), 0, None).await,
        Err(Error::CasConflict { expected: 0, current: 1 })
    ));
}

#[tokio::test]
async fn should_continue_revisions_after_purge() {
    // given
    let (_, kv, _) = setup().await;
    let bucket = unique("purge");
    kv.create_bucket(
        None,
        KvBucketSpec {
            name: bucket.clone(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    kv.put(None, &bucket, "k", b"1".to_vec(), None).await.unwrap();
    kv.put(None, &bucket, "k", b"2".to_vec(), None).await.unwrap();
    kv.delete(None, &bucket, "k").await.unwrap();

    // when - purge drops all rows, tombstone included
    let purged = kv.purge_key(None, &bucket, "k").await.unwrap();

    // then
    assert_eq!(purged, 3);
    assert!(kv.history(None, &bucket, "k", Some(10)).await.unwrap().is_empty());

    // when - the next put continues where the counter left off
    let next = kv.put(None, &bucket, "k", b"4".to_vec(), None).await.unwrap();

    // then - no resurrection at revision 1
    assert_eq!(next.revision, 4);
}

#[tokio::test]
async fn should_expire_entries_by_ttl() {
    // given
    let (store, kv, _) = setup().await;
    let bucket = unique("ttl");
    kv.create_bucket(
        None,
        KvBucketSpec {
            name: bucket.clone(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    kv.put(None, &bucket, "k", b"v".to_vec(), Some(1)).await.unwrap();
    assert!(kv.get(None, &bucket, "k").await.is_ok());

    // when - the TTL elapses
    tokio::time::sleep(Duration::from_millis(1200)).await;

    // then - reads filter the expired row before any sweep
    assert!(matches!(
        kv.get(None, &bucket, "k").await,
        Err(Error::NotFound(_))
    ));

    // and - history still shows it until the sweeper runs
    assert_eq!(kv.history(None, &bucket, "k", Some(10)).await.unwrap().len(), 1);

    // when
    let removed = sweep_expired(&store).await.unwrap();

    // then
    assert!(removed >= 1);
    assert!(kv.history(None, &bucket, "k", Some(10)).await.unwrap().is_empty());
}

#[tokio::test]
async fn should_chunk_store_and_verify_object() {
    // given - a 5 MiB body over 1 MiB chunks
    let (_, _, objects) = setup().await;
    let bucket = unique("files");
    objects
        .create_bucket(
            None,
            ObjBucketSpec {
                name: bucket.clone(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let body = pattern_bytes(5 * 1_048_576);

    // when
    let metadata = objects
        .put_object(
            None,
            &bucket,
            "blob.bin",
            UploadAttrs::default(),
            body_stream(body.clone()),
        )
        .await
        .unwrap();

    // then
    assert_eq!(metadata.size, 5_242_880);
    assert_eq!(metadata.chunk_count, 5);
    assert_eq!(metadata.digest.as_deref(), Some(digest_hex(&body).as_str()));

    // and - a full read round-trips
    let read = objects.read_all(None, &bucket, "blob.bin").await.unwrap();
    assert_eq!(read, body);

    // and - integrity verifies
    let report = objects.verify(None, &bucket, "blob.bin").await.unwrap();
    assert!(report.valid, "{}", report.message);
}

#[tokio::test]
async fn should_deduplicate_identical_content() {
    // given - two objects with identical content
    let (store, _, objects) = setup().await;
    let bucket = unique("dedup");
    objects
        .create_bucket(
            None,
            ObjBucketSpec {
                name: bucket.clone(),
                chunk_size: Some(1024),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let content = pattern_bytes(3000);

    // when
    objects
        .put_object(None, &bucket, "a", UploadAttrs::default(), body_stream(content.clone()))
        .await
        .unwrap();
    objects
        .put_object(None, &bucket, "b", UploadAttrs::default(), body_stream(content.clone()))
        .await
        .unwrap();

    // then - 3000 bytes over 1024 byte chunks is 3 shared chunks, not 6
    let shared: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(DISTINCT c.chunk_digest)
        FROM obj_metadata_chunks c
        JOIN obj_metadata m ON m.id = c.metadata_id
        JOIN obj_buckets b ON b.id = m.bucket_id
        WHERE b.name = $1
        "#,
    )
    .bind(&bucket)
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(shared, 3);

    // when - deleting one referent
    objects.delete_object(None, &bucket, "a").await.unwrap();

    // then - the other still reads correctly
    let read = objects.read_all(None, &bucket, "b").await.unwrap();
    assert_eq!(read, content);
}

#[tokio::test]
async fn should_serve_byte_ranges() {
    // given - the 36 byte alphabet object
    let (_, _, objects) = setup().await;
    let bucket = unique("ranges");
    objects
        .create_bucket(
            None,
            ObjBucketSpec {
                name: bucket.clone(),
                chunk_size: Some(8),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let body = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ".to_vec();
    objects
        .put_object(None, &bucket, "alpha", UploadAttrs::default(), body_stream(body.clone()))
        .await
        .unwrap();

    // when/then - bytes=10-14
    let resolved = range::resolve(range::parse_range_header("bytes=10-14").unwrap(), 36).unwrap();
    let data = objects
        .read_range(None, &bucket, "alpha", resolved.offset, resolved.length)
        .await
        .unwrap();
    assert_eq!(data, b"ABCDE");
    assert_eq!(resolved.content_range(36), "bytes 10-14/36");

    // when/then - bytes=30- reads the tail
    let resolved = range::resolve(range::parse_range_header("bytes=30-").unwrap(), 36).unwrap();
    let data = objects
        .read_range(None, &bucket, "alpha", resolved.offset, resolved.length)
        .await
        .unwrap();
    assert_eq!(data, b"UVWXYZ");

    // when/then - bytes=100-200 is unsatisfiable
    assert!(range::resolve(range::parse_range_header("bytes=100-200").unwrap(), 36).is_err());

    // and - every in-bounds slice matches the source bytes
    for (offset, length) in [(0u64, 36u64), (0, 1), (7, 9), (35, 1), (8, 8)] {
        let data = objects
            .read_range(None, &bucket, "alpha", offset, length)
            .await
            .unwrap();
        assert_eq!(data, &body[offset as usize..(offset + length) as usize]);
    }
}

#[tokio::test]
async fn should_replay_and_deliver_live_watch_events() {
    // given - three revisions and a listener
    let (store, kv, _) = setup().await;
    let bucket = unique("watch");
    kv.create_bucket(
        None,
        KvBucketSpec {
            name: bucket.clone(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    for value in [b"r1".to_vec(), b"r2".to_vec(), b"r3".to_vec()] {
        kv.put(None, &bucket, "k", value, None).await.unwrap();
    }

    let registry = Arc::new(WatchRegistry::new());
    let listener = ChangeListener::new(store.clone(), Arc::clone(&registry));
    listener.seed_bucket_cache().await.unwrap();
    let cancel = tokio_util::sync::CancellationToken::new();
    let handle = tokio::spawn(listener.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(300)).await;

    // when - replaying history after revision 1
    let replayed: Vec<i64> = kv
        .history(None, &bucket, "k", Some(100))
        .await
        .unwrap()
        .into_iter()
        .rev()
        .filter(|e| e.revision > 1)
        .map(|e| e.revision)
        .collect();

    // then - revisions 2 and 3, in order
    assert_eq!(replayed, vec![2, 3]);

    // when - a live put lands while subscribed
    let (_, mut rx) = registry.subscribe_kv_bucket(None, bucket.clone(), 1);
    kv.put(None, &bucket, "k", b"r4".to_vec(), None).await.unwrap();

    // then - the event for revision 4 arrives
    let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for watch event")
        .expect("registry dropped subscriber");
    assert!(frame.contains(r#""revision":4"#), "unexpected frame: {frame}");
    assert!(frame.contains(r#""type":"PUT""#));

    cancel.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn should_isolate_tenants() {
    // given - the same bucket name under two tenants
    let (_, kv, _) = setup().await;
    let bucket = unique("shared");
    for tenant in ["tenant-a", "tenant-b"] {
        kv.create_bucket(
            Some(tenant),
            KvBucketSpec {
                name: bucket.clone(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }
    kv.put(Some("tenant-a"), &bucket, "k", b"A".to_vec(), None).await.unwrap();
    kv.put(Some("tenant-b"), &bucket, "k", b"B".to_vec(), None).await.unwrap();

    // when/then - each tenant reads its own value
    let a = kv.get(Some("tenant-a"), &bucket, "k").await.unwrap();
    let b = kv.get(Some("tenant-b"), &bucket, "k").await.unwrap();
    assert_eq!(a.value.as_deref(), Some(&b"A"[..]));
    assert_eq!(b.value.as_deref(), Some(&b"B"[..]));

    // and - listings see exactly one instance of the shared name
    let visible = kv.list_buckets(Some("tenant-b")).await.unwrap();
    assert_eq!(visible.iter().filter(|bk| bk.name == bucket).count(), 1);

    // and - the global namespace sees neither
    assert!(matches!(
        kv.get(None, &bucket, "k").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn should_reject_duplicate_bucket_and_oversized_value() {
    // given
    let (_, kv, _) = setup().await;
    let bucket = unique("limits");
    kv.create_bucket(
        None,
        KvBucketSpec {
            name: bucket.clone(),
            max_value_size: Some(8),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // when/then - duplicate name conflicts
    assert!(matches!(
        kv.create_bucket(
            None,
            KvBucketSpec {
                name: bucket.clone(),
                ..Default::default()
            },
        )
        .await,
        Err(Error::Conflict(_))
    ));

    // when/then - oversized value rejected
    assert!(matches!(
        kv.put(None, &bucket, "k", vec![0u8; 9], None).await,
        Err(Error::Validation(_))
    ));
}
