//! Bundle cache tests: content addressing, idempotent create, the
//! staged-write visibility rule, and the startup bulk clear.

use worker_fleet::hash::bundle_fingerprint;
use worker_fleet::node::bundles::{BundleStore, PutOutcome};

const THRESHOLD: usize = 10;

async fn store_in(dir: &std::path::Path) -> BundleStore {
    BundleStore::open(dir, THRESHOLD).await.expect("open store")
}

#[tokio::test]
async fn upload_twice_leaves_one_copy_with_stable_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path()).await;
    let artifact = b"module.exports = () => 42;";
    let hash = bundle_fingerprint(artifact);

    store.create(&hash).await.unwrap();
    assert_eq!(
        store.put_data(&hash, artifact, Some("none")).await.unwrap(),
        PutOutcome::Stored
    );
    let first = store.describe(&hash).await.unwrap().expect("described");

    // Second identical upload converges on the same record.
    store.create(&hash).await.unwrap();
    assert_eq!(
        store.put_data(&hash, artifact, Some("none")).await.unwrap(),
        PutOutcome::Stored
    );
    let second = store.describe(&hash).await.unwrap().expect("described");

    assert_eq!(store.artifact_count().await.unwrap(), 1);
    assert_eq!(first.hash, second.hash);
    assert_eq!(first.size, second.size);
    assert_eq!(second.size, artifact.len() as u64);
}

#[tokio::test]
async fn create_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path()).await;
    let hash = bundle_fingerprint(b"abc");

    store.create(&hash).await.unwrap();
    store.create(&hash).await.unwrap();
    assert_eq!(store.artifact_count().await.unwrap(), 1);

    assert_eq!(
        store.put_data(&hash, b"abc", Some("none")).await.unwrap(),
        PutOutcome::Stored
    );
}

#[tokio::test]
async fn describe_reports_absent_until_put_completes() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path()).await;
    let hash = bundle_fingerprint(b"pending");

    assert!(store.describe(&hash).await.unwrap().is_none());

    // A reserved slot is still absent; only a completed put is visible.
    store.create(&hash).await.unwrap();
    assert!(store.describe(&hash).await.unwrap().is_none());

    store.put_data(&hash, b"pending", None).await.unwrap();
    assert!(store.describe(&hash).await.unwrap().is_some());
}

#[tokio::test]
async fn put_without_reserved_slot_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path()).await;
    let hash = bundle_fingerprint(b"nobody reserved me");

    assert_eq!(
        store.put_data(&hash, b"data", Some("none")).await.unwrap(),
        PutOutcome::NoSlot
    );
    assert!(store.describe(&hash).await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_compression_is_refused_without_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path()).await;
    let hash = bundle_fingerprint(b"zipped");
    store.create(&hash).await.unwrap();

    assert_eq!(
        store.put_data(&hash, b"zipped", Some("gzip")).await.unwrap(),
        PutOutcome::UnknownCompression
    );
    assert!(store.describe(&hash).await.unwrap().is_none());
}

#[tokio::test]
async fn startup_clears_cache_over_threshold() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = store_in(dir.path()).await;
        for i in 0..THRESHOLD + 2 {
            let data = format!("artifact {i}");
            let hash = bundle_fingerprint(data.as_bytes());
            store.create(&hash).await.unwrap();
            store
                .put_data(&hash, data.as_bytes(), Some("none"))
                .await
                .unwrap();
        }
        assert_eq!(store.artifact_count().await.unwrap(), THRESHOLD + 2);
    }

    let reopened = store_in(dir.path()).await;
    assert_eq!(reopened.artifact_count().await.unwrap(), 0);
}

#[tokio::test]
async fn startup_keeps_cache_under_threshold() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = store_in(dir.path()).await;
        for i in 0..3 {
            let data = format!("artifact {i}");
            let hash = bundle_fingerprint(data.as_bytes());
            store.create(&hash).await.unwrap();
            store
                .put_data(&hash, data.as_bytes(), Some("none"))
                .await
                .unwrap();
        }
    }

    let reopened = store_in(dir.path()).await;
    assert_eq!(reopened.artifact_count().await.unwrap(), 3);
}

#[tokio::test]
async fn path_like_fingerprints_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path()).await;

    assert!(store.create("../../etc/passwd").await.is_err());
    assert!(store.describe("not hex!").await.is_err());
}
