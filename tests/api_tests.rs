//! Integration tests for the HTTP API.

mod common;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::Utc;
use common::{challenge, proof_header, TestServer, SECRET};
use dropgate_server::blob::{BlobError, BlobReader, BlobStorage};
use dropgate_server::store::Nonce;
use serde_json::json;

/// Poll until the blob removal scheduled by a finished download lands
async fn wait_for_blob_removal(server: &TestServer, id: &str) -> bool {
    for _ in 0..50 {
        if !server.blob_exists(id).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::new();

    let (status, body) = server.json_request("GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "dropgate-server");
}

#[tokio::test]
async fn test_unknown_id_is_not_found_everywhere() {
    let server = TestServer::new();
    let id = "00112233445566778899aabbccddeeff";
    let nonce = Nonce::random();

    let (status, _) = server.json_request("GET", &format!("/api/exist/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = server.proved_get(&format!("/api/metadata/{}", id), &nonce).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = server.proved_get(&format!("/api/download/{}", id), &nonce).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let owner = json!({ "id": id, "owner_token": "whatever" });
    let (status, _) = server.json_request("POST", "/api/info", Some(owner.clone())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = server
        .json_request(
            "POST",
            &format!("/api/password/{}", id),
            Some(json!({ "owner_token": "whatever", "auth": SECRET })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = server.json_request("DELETE", "/api/delete", Some(owner)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_exist_advertises_challenge() {
    let server = TestServer::new();
    let record = server.seed_file(b"hello", 0, None).await;

    let request = Request::builder()
        .uri(format!("/api/exist/{}", record.id))
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = server.send(request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(challenge(&headers), Some(record.nonce));
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["requiresPassword"], false);
}

#[tokio::test]
async fn test_metadata_rotates_nonce_and_rejects_replay() {
    let server = TestServer::new();
    let record = server.seed_file(b"hello", 3, None).await;
    let uri = format!("/api/metadata/{}", record.id);

    let (status, headers, body) = server.proved_get(&uri, &record.nonce).await;
    assert_eq!(status, StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["metadata"], "encrypted-metadata");
    assert_eq!(body["finalDownload"], false);
    assert_eq!(body["ttl"], -1);

    let next = challenge(&headers).unwrap();
    assert_ne!(next, record.nonce);
    assert_eq!(server.nonce_of(&record.id), next);

    // Replaying the old proof fails and re-advertises the current nonce
    let (status, headers, _) = server.proved_get(&uri, &record.nonce).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(challenge(&headers), Some(next));
    assert_eq!(server.nonce_of(&record.id), next);

    // The advertised nonce still works
    let (status, _, _) = server.proved_get(&uri, &next).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_bad_proof_keeps_nonce() {
    let server = TestServer::new();
    let record = server.seed_file(b"hello", 0, None).await;
    let uri = format!("/api/download/{}", record.id);

    let request = Request::builder()
        .uri(&uri)
        .header(header::AUTHORIZATION, "send-v1 3yZe7d")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = server.send(request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(challenge(&headers), Some(record.nonce));
    assert_eq!(server.state.store().get(&record.id).unwrap().download_count, 0);
}

#[tokio::test]
async fn test_missing_authorization_is_bad_request() {
    let server = TestServer::new();
    let record = server.seed_file(b"hello", 0, None).await;

    for uri in [
        format!("/api/metadata/{}", record.id),
        format!("/api/download/{}", record.id),
    ] {
        let (status, _) = server.json_request("GET", &uri, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    let request = Request::builder()
        .uri(format!("/api/metadata/{}", record.id))
        .header(header::AUTHORIZATION, "nospace")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = server.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(server.nonce_of(&record.id), record.nonce);
}

#[tokio::test]
async fn test_download_limit_then_self_destruct() {
    let server = TestServer::new();
    let contents = b"the quick brown fox".to_vec();
    let record = server.seed_file(&contents, 2, None).await;
    let uri = format!("/api/download/{}", record.id);

    let (status, headers, body) = server.proved_get(&uri, &server.nonce_of(&record.id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, contents);
    assert_eq!(
        headers.get(header::CONTENT_LENGTH).unwrap(),
        &contents.len().to_string()
    );
    assert_eq!(
        headers.get(header::CONTENT_TYPE).unwrap(),
        "application/octet-stream"
    );

    // One slot left: the next download is the final one
    let next = challenge(&headers).unwrap();
    let meta_uri = format!("/api/metadata/{}", record.id);
    let (status, headers, body) = server.proved_get(&meta_uri, &next).await;
    assert_eq!(status, StatusCode::OK);
    let meta: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(meta["finalDownload"], true);

    let next = challenge(&headers).unwrap();
    let (status, _, body) = server.proved_get(&uri, &next).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, contents);

    // Body fully streamed: record is gone, blob follows
    assert!(server.state.store().get(&record.id).is_none());
    let (status, _) = server.json_request("GET", &format!("/api/exist/{}", record.id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert!(wait_for_blob_removal(&server, &record.id).await);

    let (status, _, _) = server.proved_get(&uri, &Nonce::random()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unlimited_downloads() {
    let server = TestServer::new();
    let record = server.seed_file(b"data", 0, None).await;
    let uri = format!("/api/download/{}", record.id);

    let mut nonce = record.nonce;
    for _ in 0..5 {
        let (status, headers, body) = server.proved_get(&uri, &nonce).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"data");
        nonce = challenge(&headers).unwrap();
    }

    let stored = server.state.store().get(&record.id).unwrap();
    assert_eq!(stored.download_count, 5);
    assert!(server.blob_exists(&record.id).await);
}

#[tokio::test]
async fn test_exhausted_record_rejects_download() {
    let server = TestServer::new();
    let record = server.seed_file(b"data", 1, None).await;
    // Last slot taken, body still being streamed elsewhere
    server
        .state
        .store()
        .update(&record.id, |r| r.download_count = 1)
        .unwrap();

    let (status, headers, _) = server
        .proved_get(&format!("/api/download/{}", record.id), &record.nonce)
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(challenge(&headers), Some(record.nonce));
    assert_eq!(server.nonce_of(&record.id), record.nonce);
}

#[tokio::test]
async fn test_download_of_missing_blob_drops_record() {
    let server = TestServer::new();
    let record = server.seed_file(b"data", 1, None).await;
    server.state.blobs().remove(&record.id).await.unwrap();

    let (status, _, _) = server
        .proved_get(&format!("/api/download/{}", record.id), &record.nonce)
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(server.state.store().get(&record.id).is_none());
}

/// Backend whose blobs can be written but never read back
struct UnreadableBlobs;

#[async_trait::async_trait]
impl BlobStorage for UnreadableBlobs {
    async fn create(&self, _id: &str) -> Result<(), BlobError> {
        Ok(())
    }

    async fn append(&self, _id: &str, _data: &[u8]) -> Result<(), BlobError> {
        Ok(())
    }

    async fn remove(&self, _id: &str) -> Result<bool, BlobError> {
        Ok(true)
    }

    async fn open(&self, _id: &str) -> Result<BlobReader, BlobError> {
        Err(BlobError::Io(io::Error::new(io::ErrorKind::Other, "read failed")))
    }

    async fn list_ids(&self) -> Result<Vec<String>, BlobError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_unreadable_blob_releases_download_slot() {
    let server = TestServer::with_blob_backend(Arc::new(UnreadableBlobs));
    let record = server.seed_file(b"data", 1, None).await;
    let uri = format!("/api/download/{}", record.id);

    let (status, headers, _) = server.proved_get(&uri, &record.nonce).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    // The proof was spent, so the fresh nonce comes back with the error
    let next = challenge(&headers).unwrap();
    assert_ne!(next, record.nonce);
    assert_eq!(server.nonce_of(&record.id), next);

    let stored = server.state.store().get(&record.id).unwrap();
    assert_eq!(stored.download_count, 0);

    // The slot is still there for a retry
    let (status, headers, _) = server.proved_get(&uri, &next).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(challenge(&headers).is_some());
    assert_eq!(server.state.store().get(&record.id).unwrap().download_count, 0);
}

#[tokio::test]
async fn test_racing_last_slot_has_one_winner() {
    let server = Arc::new(TestServer::new());
    let record = server.seed_file(b"race", 1, None).await;
    let uri = format!("/api/download/{}", record.id);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let server = server.clone();
        let uri = uri.clone();
        let nonce = record.nonce;
        tasks.push(tokio::spawn(async move { server.proved_get(&uri, &nonce).await.0 }));
    }

    let mut ok = 0;
    for task in tasks {
        match task.await.unwrap() {
            StatusCode::OK => ok += 1,
            StatusCode::UNAUTHORIZED | StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {}
            other => panic!("unexpected status {}", other),
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test]
async fn test_expired_record_is_not_found() {
    let server = TestServer::new();
    let record = server
        .seed_file(b"old", 0, Some(Utc::now() - chrono::Duration::seconds(5)))
        .await;

    let (status, _) = server.json_request("GET", &format!("/api/exist/{}", record.id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = server
        .proved_get(&format!("/api/metadata/{}", record.id), &record.nonce)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = server
        .json_request(
            "POST",
            &format!("/api/info/{}", record.id),
            Some(json!({ "owner_token": record.owner_token })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unfinished_upload_is_not_found() {
    let server = TestServer::new();
    let record = server.seed_file(b"partial", 0, None).await;
    server.state.store().update(&record.id, |r| r.length = None).unwrap();

    let (status, _, _) = server
        .proved_get(&format!("/api/metadata/{}", record.id), &record.nonce)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(server.nonce_of(&record.id), record.nonce);
}

#[tokio::test]
async fn test_info_single_and_batch() {
    let server = TestServer::new();
    let a = server
        .seed_file(b"a", 5, Some(Utc::now() + chrono::Duration::hours(1)))
        .await;
    let b = server.seed_file(b"b", 0, None).await;

    let (status, body) = server
        .json_request(
            "POST",
            "/api/info",
            Some(json!({ "id": a.id, "owner_token": a.owner_token })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["dlimit"], 5);
    assert_eq!(body["dtotal"], 0);
    let ttl = body["ttl"].as_i64().unwrap();
    assert!(ttl > 3_500_000 && ttl <= 3_600_000);

    let (status, body) = server
        .json_request(
            "POST",
            &format!("/api/info/{}", b.id),
            Some(json!({ "owner_token": b.owner_token })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ttl"], -1);

    let (status, _) = server
        .json_request("POST", "/api/info", Some(json!({ "id": a.id, "owner_token": "wrong" })))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = server
        .json_request(
            "POST",
            "/api/info",
            Some(json!({
                "id": [a.id, "feedface", b.id],
                "owner_token": [a.owner_token, "x", "wrong"],
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0]["exist"], true);
    assert_eq!(entries[0]["dlimit"], 5);
    assert_eq!(entries[1]["exist"], false);
    assert_eq!(entries[2]["exist"], false);

    // Owner operations never rotate
    assert_eq!(server.nonce_of(&a.id), a.nonce);
}

#[tokio::test]
async fn test_info_rejects_malformed_body() {
    let server = TestServer::new();

    let (status, _) = server
        .json_request("POST", "/api/info", Some(json!({ "id": ["a", "b"], "owner_token": ["x"] })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server
        .json_request("POST", "/api/info", Some(json!({ "id": "a", "owner_token": ["x"] })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server.json_request("POST", "/api/info", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_set_password_switches_secret() {
    let server = TestServer::new();
    let record = server.seed_file(b"secret stuff", 0, None).await;
    let new_secret = "4vJ9JU1bJJE96FWSJKvHsmmFADCg4gpZQff4P3bkLKi";
    let uri = format!("/api/password/{}", record.id);

    let (status, _) = server
        .json_request("POST", &uri, Some(json!({ "owner_token": "wrong", "auth": new_secret })))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = server
        .json_request(
            "POST",
            &uri,
            Some(json!({ "owner_token": record.owner_token, "auth": "0OIl" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server
        .json_request(
            "POST",
            &uri,
            Some(json!({ "owner_token": record.owner_token, "auth": new_secret })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = server.json_request("GET", &format!("/api/exist/{}", record.id), None).await;
    assert_eq!(body["requiresPassword"], true);

    // Proofs with the old secret no longer work
    let (status, _, _) = server
        .proved_get(&format!("/api/metadata/{}", record.id), &record.nonce)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri(format!("/api/metadata/{}", record.id))
        .header(
            header::AUTHORIZATION,
            dropgate_server::auth::authorization_value(new_secret, &record.nonce).unwrap(),
        )
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = server.send(request).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_delete_single() {
    let server = TestServer::new();
    let record = server.seed_file(b"bye", 0, None).await;

    let (status, _) = server
        .json_request(
            "DELETE",
            "/api/delete",
            Some(json!({ "id": record.id, "owner_token": "nope" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(server.state.store().get(&record.id).is_some());

    let (status, _) = server
        .json_request(
            "DELETE",
            "/api/delete",
            Some(json!({ "id": record.id, "owner_token": record.owner_token })),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(server.state.store().get(&record.id).is_none());
    assert!(!server.blob_exists(&record.id).await);

    let (status, _) = server
        .json_request(
            "DELETE",
            "/api/delete",
            Some(json!({ "id": record.id, "owner_token": record.owner_token })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_batch_skips_mismatches() {
    let server = TestServer::new();
    let a = server.seed_file(b"a", 0, None).await;
    let b = server.seed_file(b"b", 0, None).await;

    let (status, _) = server
        .json_request(
            "DELETE",
            "/api/delete",
            Some(json!({
                "id": [a.id, b.id, "feedface"],
                "owner_token": [a.owner_token, "wrong", "x"],
            })),
        )
        .await;

    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(server.state.store().get(&a.id).is_none());
    assert!(server.state.store().get(&b.id).is_some());
    assert!(server.blob_exists(&b.id).await);
}

#[tokio::test]
async fn test_delete_during_download_is_consistent() {
    let server = TestServer::new();
    let contents = vec![7u8; 256 * 1024];
    let record = server.seed_file(&contents, 0, None).await;

    let request = Request::builder()
        .uri(format!("/api/download/{}", record.id))
        .header(header::AUTHORIZATION, proof_header(&record.nonce))
        .body(Body::empty())
        .unwrap();
    let response = tower::ServiceExt::oneshot(server.router.clone(), request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (status, _) = server
        .json_request(
            "DELETE",
            "/api/delete",
            Some(json!({ "id": record.id, "owner_token": record.owner_token })),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // The open download still completes with the full contents
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.len(), contents.len());

    assert!(server.state.store().get(&record.id).is_none());
    assert!(!server.blob_exists(&record.id).await);
}

#[tokio::test]
async fn test_saturated_pool_returns_503() {
    let server = TestServer::with_config(|config| config.server.http_workers = 1);

    let held = server.state.http_pool().try_acquire().unwrap();
    let (status, body) = server.json_request("GET", "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "overloaded");

    drop(held);
    let (status, _) = server.json_request("GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
}
