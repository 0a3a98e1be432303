//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Utc};
use dropgate_server::auth;
use dropgate_server::channel::{self, ChannelConfig, Frame};
use dropgate_server::blob::{BlobStorage, BlobStore};
use dropgate_server::store::{FileRecord, FileStore, Nonce};
use dropgate_server::upload::{SessionOutcome, UploadSession};
use dropgate_server::{routes, AppState, Config};
use futures::channel::mpsc;
use futures::StreamExt;
use serde_json::Value;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tower::ServiceExt;

/// Base58 secret used by every fixture
pub const SECRET: &str = "3mJr7AoUXx2Wqd";

pub struct TestServer {
    pub router: Router,
    pub state: AppState,
    _temp_dir: TempDir,
}

impl TestServer {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(customize: impl FnOnce(&mut Config)) -> Self {
        Self::build(customize, |config| {
            BlobStore::with_local_storage(config.storage.data_dir.clone())
        })
    }

    /// Server storing blobs in `backend` instead of the data directory
    pub fn with_blob_backend(backend: Arc<dyn BlobStorage>) -> Self {
        Self::build(|_| {}, |_| BlobStore::with_backend(backend))
    }

    fn build(
        customize: impl FnOnce(&mut Config),
        blobs: impl FnOnce(&Config) -> BlobStore,
    ) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.server.public_url = "http://dropgate.test".to_string();
        config.storage.data_dir = temp_dir.path().join("data");
        config.storage.snapshot_path = temp_dir.path().join("config").join("data.json");
        customize(&mut config);

        let blobs = blobs(&config);
        let store = FileStore::with_shards(config.storage.shards);
        let state = AppState::with_parts(config, store, blobs);
        Self {
            router: routes::app(state.clone()),
            state,
            _temp_dir: temp_dir,
        }
    }

    /// Store a finished upload directly
    pub async fn seed_file(
        &self,
        contents: &[u8],
        download_limit: u32,
        expire_at: Option<DateTime<Utc>>,
    ) -> FileRecord {
        let mut record = FileRecord::new(
            SECRET.to_string(),
            "encrypted-metadata".to_string(),
            expire_at,
            download_limit,
            false,
        );
        record.length = Some(contents.len() as u64);

        self.state.blobs().create(&record.id).await.unwrap();
        self.state.blobs().append(&record.id, contents).await.unwrap();
        assert!(self.state.store().insert_new(record.clone()));
        record
    }

    pub fn nonce_of(&self, id: &str) -> Nonce {
        self.state.store().get(id).unwrap().nonce
    }

    pub async fn blob_exists(&self, id: &str) -> bool {
        self.state.blobs().open(id).await.is_ok()
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body.to_vec())
    }

    pub async fn json_request(
        &self,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(serde_json::to_vec(&v).unwrap())
            }
            None => Body::empty(),
        };

        let (status, _, bytes) = self.send(builder.body(body).unwrap()).await;
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    /// GET with a proof over `nonce`
    pub async fn proved_get(&self, uri: &str, nonce: &Nonce) -> (StatusCode, HeaderMap, Vec<u8>) {
        let request = Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, proof_header(nonce))
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }
}

pub fn proof_header(nonce: &Nonce) -> String {
    auth::authorization_value(SECRET, nonce).unwrap()
}

/// Nonce advertised in a `WWW-Authenticate` header
pub fn challenge(headers: &HeaderMap) -> Option<Nonce> {
    let value = headers.get(header::WWW_AUTHENTICATE)?.to_str().ok()?;
    let (scheme, nonce) = value.split_once(' ')?;
    assert_eq!(scheme, auth::AUTH_SCHEME);
    Nonce::from_base58(nonce)
}

// ============================================================================
// In-memory upload client
// ============================================================================

pub struct UploadClient {
    to_server: mpsc::UnboundedSender<Result<Frame, Infallible>>,
    from_server: mpsc::UnboundedReceiver<Frame>,
}

impl UploadClient {
    pub fn send_text(&self, text: &str) {
        self.to_server
            .unbounded_send(Ok(Frame::Text(text.to_string())))
            .unwrap();
    }

    pub fn send_binary(&self, data: &[u8]) {
        // The server may already have hung up
        let _ = self.to_server.unbounded_send(Ok(Frame::Binary(data.to_vec())));
    }

    pub fn hang_up(&self) {
        self.to_server.close_channel();
    }

    /// Next frame from the server other than keepalive pings
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match self.from_server.next().await? {
                Frame::Ping(_) => continue,
                frame => return Some(frame),
            }
        }
    }

    pub async fn next_json(&mut self) -> Value {
        match self.next_frame().await {
            Some(Frame::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }
}

/// Open an upload connection over in-memory channels
pub fn start_upload(state: &AppState) -> (UploadClient, JoinHandle<SessionOutcome>) {
    let (to_server, server_stream) = mpsc::unbounded();
    let (server_sink, from_server) = mpsc::unbounded();

    let conn = channel::open(
        server_stream,
        server_sink,
        ChannelConfig::from(&state.config().limits),
        state.background_pool(),
    )
    .unwrap();

    let session = UploadSession::new(
        state.store().clone(),
        state.blobs().clone(),
        state.config().limits.clone(),
        state.config().server.public_url.clone(),
    );

    (
        UploadClient {
            to_server,
            from_server,
        },
        tokio::spawn(session.run(conn)),
    )
}

pub fn handshake(download_limit: u64, time_limit: u64) -> String {
    serde_json::json!({
        "authorization": format!("send-v1 {}", SECRET),
        "fileMetadata": "encrypted-metadata",
        "dlimit": download_limit,
        "timeLimit": time_limit,
    })
    .to_string()
}
