//! HTTP surface tests: identity, health, auth, and the bundle endpoints
//! over a real connection.

mod test_harness;

use reqwest::StatusCode;
use test_harness::{start_node, TEST_PASS, TEST_USER};
use worker_fleet::hash::bundle_fingerprint;

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

#[tokio::test]
async fn identity_reports_name_version_and_server_header() {
    let node = start_node().await;

    let response = client()
        .get(node.bare_url())
        .basic_auth(TEST_USER, Some(TEST_PASS))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let server = response
        .headers()
        .get("server")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert_eq!(server, format!("worker-fleet/{}", env!("CARGO_PKG_VERSION")));

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["name"], "worker-fleet-node");
    assert_eq!(body["nodeVersion"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn health_reports_worker_count_and_core_utilization() {
    let node = start_node().await;

    let body: serde_json::Value = client()
        .get(format!("{}/health", node.bare_url()))
        .basic_auth(TEST_USER, Some(TEST_PASS))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["workersRunning"], 0);
    let usage = body["cpuUsage"].as_array().unwrap();
    for core in usage {
        let value = core.as_f64().unwrap();
        assert!((0.0..=1.0).contains(&value), "core utilization {value}");
    }
}

#[tokio::test]
async fn missing_or_wrong_credentials_get_401_with_challenge() {
    let node = start_node().await;

    let unauthenticated = client()
        .get(format!("{}/health", node.bare_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        unauthenticated
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok()),
        Some("Basic realm=\"worker_threads_nodes\"")
    );

    let wrong = client()
        .get(format!("{}/health", node.bare_url()))
        .basic_auth(TEST_USER, Some("wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn bundle_endpoints_follow_the_upload_protocol() {
    let node = start_node().await;
    let http = client();
    let artifact = b"message hi\nexit 0\n";
    let hash = bundle_fingerprint(artifact);
    let base = node.bare_url();

    // Describe before anything exists: 404.
    let missing = http
        .get(format!("{base}/bundles/{hash}"))
        .basic_auth(TEST_USER, Some(TEST_PASS))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    // Reserve a slot: 201. Still absent until data lands.
    let created = http
        .post(format!("{base}/bundles/create"))
        .basic_auth(TEST_USER, Some(TEST_PASS))
        .json(&serde_json::json!({ "hash": hash }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);

    let reserved = http
        .get(format!("{base}/bundles/{hash}"))
        .basic_auth(TEST_USER, Some(TEST_PASS))
        .send()
        .await
        .unwrap();
    assert_eq!(reserved.status(), StatusCode::NOT_FOUND);

    // Non-binary body: 400.
    let wrong_type = http
        .post(format!("{base}/bundles/{hash}/data?compression=none"))
        .basic_auth(TEST_USER, Some(TEST_PASS))
        .header("content-type", "text/plain")
        .body(artifact.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_type.status(), StatusCode::BAD_REQUEST);

    // Unknown compression: refused, nothing written.
    let unknown_codec = http
        .post(format!("{base}/bundles/{hash}/data?compression=zstd"))
        .basic_auth(TEST_USER, Some(TEST_PASS))
        .header("content-type", "application/octet-stream")
        .body(artifact.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(unknown_codec.status(), StatusCode::BAD_REQUEST);

    // Proper upload: 204, then describe succeeds.
    let stored = http
        .post(format!("{base}/bundles/{hash}/data?compression=none"))
        .basic_auth(TEST_USER, Some(TEST_PASS))
        .header("content-type", "application/octet-stream")
        .body(artifact.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(stored.status(), StatusCode::NO_CONTENT);

    let described: serde_json::Value = http
        .get(format!("{base}/bundles/{hash}"))
        .basic_auth(TEST_USER, Some(TEST_PASS))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(described["hash"], hash);
    assert_eq!(described["size"], artifact.len() as u64);
    assert!(described["created"].is_string());

    // Data for a fingerprint nobody reserved: 404.
    let unreserved_hash = bundle_fingerprint(b"other");
    let no_slot = http
        .post(format!("{base}/bundles/{unreserved_hash}/data?compression=none"))
        .basic_auth(TEST_USER, Some(TEST_PASS))
        .header("content-type", "application/octet-stream")
        .body(b"other".to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(no_slot.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn workers_listing_starts_empty() {
    let node = start_node().await;
    let ids: Vec<String> = client()
        .get(format!("{}/workers", node.bare_url()))
        .basic_auth(TEST_USER, Some(TEST_PASS))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(ids.is_empty());
}

#[tokio::test]
async fn worker_create_with_unknown_fingerprint_is_rejected() {
    let node = start_node().await;
    let response = client()
        .post(format!("{}/worker", node.bare_url()))
        .basic_auth(TEST_USER, Some(TEST_PASS))
        .json(&serde_json::json!({
            "bundleHash": bundle_fingerprint(b"never uploaded"),
            "extraData": {},
            "exitOnRequestEnd": true,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn streams_pipe_for_unknown_worker_is_404() {
    let node = start_node().await;
    let id = uuid::Uuid::new_v4();

    let get = client()
        .get(format!("{}/worker/{id}/streams-pipe", node.bare_url()))
        .basic_auth(TEST_USER, Some(TEST_PASS))
        .send()
        .await
        .unwrap();
    assert_eq!(get.status(), StatusCode::NOT_FOUND);

    let post = client()
        .post(format!("{}/worker/{id}/streams-pipe", node.bare_url()))
        .basic_auth(TEST_USER, Some(TEST_PASS))
        .body("terminate: true\n")
        .send()
        .await
        .unwrap();
    assert_eq!(post.status(), StatusCode::NOT_FOUND);
}
