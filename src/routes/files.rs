//! File resource routes
//!
//! Recipients authenticate with nonce proofs (metadata, download), owners with
//! the owner token in the JSON body (info, password, delete). Unknown, expired
//! and unfinished files all answer the same 404.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::auth::{self, Access};
use crate::blob::{BlobError, BlobStore, ByteStream};
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::store::{FileRecord, FileStore, Nonce};

/// Create the files router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/exist/:id", get(exists))
        .route("/info", post(info))
        .route("/info/:id", post(info_one))
        .route("/password/:id", post(set_password))
        .route("/delete", delete(delete_files))
        .route("/metadata/:id", get(metadata))
        .route("/download/:id", get(download))
}

// ============================================================================
// Request / Response Types
// ============================================================================

/// A single value or a parallel array
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// `{id, owner_token}`, either both strings or two arrays of equal length
#[derive(Debug, Deserialize)]
struct OwnerBody {
    id: OneOrMany,
    owner_token: OneOrMany,
}

enum OwnerRequest {
    Single { id: String, token: String },
    Batch(Vec<(String, String)>),
}

impl OwnerBody {
    fn into_request(self) -> Result<OwnerRequest> {
        match (self.id, self.owner_token) {
            (OneOrMany::One(id), OneOrMany::One(token)) => Ok(OwnerRequest::Single { id, token }),
            (OneOrMany::Many(ids), OneOrMany::Many(tokens)) if ids.len() == tokens.len() => {
                Ok(OwnerRequest::Batch(ids.into_iter().zip(tokens).collect()))
            }
            _ => Err(AppError::BadRequest(
                "id and owner_token must be both strings or arrays of equal length".to_string(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OwnerTokenBody {
    owner_token: String,
}

#[derive(Debug, Deserialize)]
struct PasswordBody {
    owner_token: String,
    auth: String,
}

#[derive(Debug, Serialize)]
struct ExistResponse {
    #[serde(rename = "requiresPassword")]
    requires_password: bool,
}

#[derive(Debug, Default, Serialize)]
struct InfoResponse {
    dlimit: u32,
    dtotal: u32,
    /// Milliseconds left, -1 without expiry
    ttl: i64,
}

impl InfoResponse {
    fn of(record: &FileRecord, now: DateTime<Utc>) -> Self {
        Self {
            dlimit: record.download_limit,
            dtotal: record.download_count,
            ttl: record.ttl_millis(now),
        }
    }
}

#[derive(Debug, Serialize)]
struct InfoEntry {
    #[serde(flatten)]
    info: InfoResponse,
    exist: bool,
}

#[derive(Debug, Serialize)]
struct MetadataResponse {
    metadata: String,
    #[serde(rename = "finalDownload")]
    final_download: bool,
    ttl: i64,
}

fn json_body<T>(body: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    body.map(|Json(value)| value)
        .map_err(|e| AppError::BadRequest(e.body_text()))
}

// ============================================================================
// Anonymous
// ============================================================================

/// Probe whether a file exists and fetch its current challenge
async fn exists(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    let record = auth::current_challenge(state.store(), &id, Utc::now())
        .filter(FileRecord::is_complete)
        .ok_or(AppError::NotFound)?;

    Ok((
        [(header::WWW_AUTHENTICATE, auth::challenge_value(&record.nonce))],
        Json(ExistResponse {
            requires_password: record.password_protected,
        }),
    )
        .into_response())
}

// ============================================================================
// Owner
// ============================================================================

/// Inspect one file or a batch
async fn info(
    State(state): State<AppState>,
    body: std::result::Result<Json<OwnerBody>, JsonRejection>,
) -> Result<Response> {
    let now = Utc::now();

    match json_body(body)?.into_request()? {
        OwnerRequest::Single { id, token } => {
            let info = auth::with_owner(state.store(), &id, &token, now, |record| {
                InfoResponse::of(record, now)
            })?;
            Ok(Json(info).into_response())
        }
        OwnerRequest::Batch(entries) => {
            let results: Vec<InfoEntry> = entries
                .iter()
                .map(|(id, token)| {
                    let info = auth::with_owner(state.store(), id, token, now, |record| {
                        InfoResponse::of(record, now)
                    });
                    match info {
                        Ok(info) => InfoEntry { info, exist: true },
                        Err(_) => InfoEntry {
                            info: InfoResponse::default(),
                            exist: false,
                        },
                    }
                })
                .collect();
            Ok(Json(results).into_response())
        }
    }
}

async fn info_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: std::result::Result<Json<OwnerTokenBody>, JsonRejection>,
) -> Result<Json<InfoResponse>> {
    let body = json_body(body)?;
    let now = Utc::now();
    let info = auth::with_owner(state.store(), &id, &body.owner_token, now, |record| {
        InfoResponse::of(record, now)
    })?;
    Ok(Json(info))
}

/// Replace the auth secret; recipients must then prove the new one
async fn set_password(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: std::result::Result<Json<PasswordBody>, JsonRejection>,
) -> Result<StatusCode> {
    let body = json_body(body)?;
    if body.owner_token.is_empty() {
        return Err(AppError::BadRequest("owner_token is required".to_string()));
    }
    let secret = auth::secret_from_authorization(&body.auth)
        .ok_or_else(|| AppError::BadRequest("auth must be a base58 secret".to_string()))?
        .to_string();

    auth::with_owner(state.store(), &id, &body.owner_token, Utc::now(), |record| {
        record.auth_secret = secret;
        record.password_protected = true;
    })?;

    tracing::info!(file_id = %id, "Password set");
    Ok(StatusCode::OK)
}

/// Delete one file or a batch. Batch deletes skip unknown ids and wrong tokens.
async fn delete_files(
    State(state): State<AppState>,
    body: std::result::Result<Json<OwnerBody>, JsonRejection>,
) -> Result<StatusCode> {
    let now = Utc::now();

    match json_body(body)?.into_request()? {
        OwnerRequest::Single { id, token } => {
            auth::remove_as_owner(state.store(), &id, &token, now)?;
            state.blobs().discard(&id).await;
            tracing::info!(file_id = %id, "File deleted by owner");
        }
        OwnerRequest::Batch(entries) => {
            for (id, token) in entries {
                if auth::remove_as_owner(state.store(), &id, &token, now).is_ok() {
                    state.blobs().discard(&id).await;
                    tracing::info!(file_id = %id, "File deleted by owner");
                }
            }
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Recipient
// ============================================================================

async fn metadata(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let proof = auth::parse_authorization(&headers)?;
    let now = Utc::now();
    let granted = auth::authorize(state.store(), &id, &proof, Access::Metadata, now)?;

    let body = MetadataResponse {
        final_download: granted.record.is_final_download(),
        ttl: granted.record.ttl_millis(now),
        metadata: granted.record.metadata,
    };

    Ok((
        [(header::WWW_AUTHENTICATE, auth::challenge_value(&granted.next_nonce))],
        Json(body),
    )
        .into_response())
}

/// Stream the blob. The download that uses the last slot deletes the file
/// once its body is done.
async fn download(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let proof = auth::parse_authorization(&headers)?;
    let granted = auth::authorize(state.store(), &id, &proof, Access::Download, Utc::now())?;
    let record = granted.record;

    let reader = match state.blobs().open(&id).await {
        Ok(reader) => reader,
        Err(BlobError::NotFound(_)) => {
            // Nothing left to serve: the record must not outlive its blob
            state.store().remove(&id);
            tracing::warn!(file_id = %id, "Blob missing, record dropped");
            return Err(AppError::NotFound);
        }
        Err(e) => {
            state.store().release_download(&id);
            tracing::warn!(file_id = %id, error = %e, "Blob unreadable, download slot released");
            return Ok(with_challenge(
                AppError::from(e).into_response(),
                &granted.next_nonce,
            ));
        }
    };
    let last_download = record.is_exhausted();

    tracing::info!(
        file_id = %id,
        download = record.download_count,
        limit = record.download_limit,
        last_download,
        "Download started"
    );

    let stream: ByteStream = if last_download {
        Box::pin(SelfDestruct::new(reader.stream, &id, state.store(), state.blobs()))
    } else {
        reader.stream
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, reader.length)
        .header(header::WWW_AUTHENTICATE, auth::challenge_value(&granted.next_nonce))
        .body(Body::from_stream(stream))
        .map_err(|e| AppError::Internal(e.to_string()))
}

fn with_challenge(mut response: Response, nonce: &Nonce) -> Response {
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, auth::challenge_value(nonce));
    response
}

// ============================================================================
// Self-destructing Body
// ============================================================================

/// Byte stream that deletes its file when dropped, after the last chunk went
/// out or when the client went away early.
struct SelfDestruct {
    inner: ByteStream,
    id: String,
    store: FileStore,
    blobs: BlobStore,
}

impl SelfDestruct {
    fn new(inner: ByteStream, id: &str, store: &FileStore, blobs: &BlobStore) -> Self {
        Self {
            inner,
            id: id.to_string(),
            store: store.clone(),
            blobs: blobs.clone(),
        }
    }
}

impl Stream for SelfDestruct {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for SelfDestruct {
    fn drop(&mut self) {
        self.store.remove(&self.id);
        tracing::info!(file_id = %self.id, "Download limit reached, file destroyed");

        let id = std::mem::take(&mut self.id);
        let blobs = self.blobs.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { blobs.discard(&id).await });
            }
            Err(_) => tracing::warn!(
                file_id = %id,
                "No runtime to remove blob, left for the startup sweep"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_info_ttl_measured_from_given_instant() {
        let now = Utc::now();
        let mut record = FileRecord::new("3mJr7AoUXx2Wqd".into(), String::new(), None, 3, false);
        record.download_count = 1;

        let info = InfoResponse::of(&record, now);
        assert_eq!((info.dlimit, info.dtotal, info.ttl), (3, 1, -1));

        record.expire_at = Some(now + Duration::seconds(90));
        assert_eq!(InfoResponse::of(&record, now).ttl, 90_000);
        assert_eq!(InfoResponse::of(&record, now + Duration::seconds(30)).ttl, 60_000);
    }
}
