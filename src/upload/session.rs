//! Upload Session
//!
//! One session per upload connection:
//!
//! ```text
//! AwaitingHandshake --handshake--> Streaming --0x00--> Finalized
//!         |                            |
//!         +----------> Aborted <-------+
//! ```
//!
//! The record is inserted at handshake time, before any byte is accepted, so
//! the owner can already inspect or delete it. It only becomes downloadable
//! once `length` is set at finalization. An aborted session removes both the
//! record and the partial blob.

use chrono::Utc;

use super::types::{
    CompleteAck, HandshakeAck, HandshakeRequest, UploadError, COMPLETE_SENTINEL,
};
use crate::auth;
use crate::blob::{BlobError, BlobStore};
use crate::channel::{Connection, Outbound};
use crate::config::LimitsConfig;
use crate::store::{FileRecord, FileStore};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    AwaitingHandshake,
    Streaming,
    Finalized,
    Aborted,
}

/// How a session ended
#[derive(Debug)]
pub enum SessionOutcome {
    Finalized { id: String, length: u64 },
    Aborted {
        /// Set when a record had already been created
        id: Option<String>,
        reason: UploadError,
    },
}

/// Drives one upload connection from handshake to completion
pub struct UploadSession {
    store: FileStore,
    blobs: BlobStore,
    limits: LimitsConfig,
    public_url: String,
    state: SessionState,
    file_id: Option<String>,
    received: u64,
}

impl UploadSession {
    pub fn new(
        store: FileStore,
        blobs: BlobStore,
        limits: LimitsConfig,
        public_url: String,
    ) -> Self {
        Self {
            store,
            blobs,
            limits,
            public_url,
            state: SessionState::AwaitingHandshake,
            file_id: None,
            received: 0,
        }
    }

    /// Run until the upload finalizes or the connection dies, then close the
    /// connection. Queued acks are flushed before the close frame.
    pub async fn run(mut self, mut conn: Connection) -> SessionOutcome {
        let result = self.drive(&mut conn).await;
        conn.close.cancel();

        match result {
            Ok(length) => {
                let id = self.file_id.unwrap_or_default();
                tracing::info!(file_id = %id, length, "Upload finalized");
                SessionOutcome::Finalized { id, length }
            }
            Err(reason) => {
                self.abort().await;
                tracing::warn!(
                    file_id = ?self.file_id,
                    received = self.received,
                    reason = %reason,
                    "Upload aborted"
                );
                SessionOutcome::Aborted {
                    id: self.file_id,
                    reason,
                }
            }
        }
    }

    async fn drive(&mut self, conn: &mut Connection) -> Result<u64, UploadError> {
        loop {
            let message = conn.recv().await.ok_or(UploadError::Disconnected)?;
            if let Some(length) = self.handle(&message, &conn.outbound).await? {
                return Ok(length);
            }
        }
    }

    /// Process one inbound message. Returns the final length once the upload
    /// is complete.
    pub async fn handle(
        &mut self,
        message: &[u8],
        outbound: &Outbound,
    ) -> Result<Option<u64>, UploadError> {
        match self.state {
            SessionState::AwaitingHandshake => {
                let ack = self.handshake(message).await?;
                outbound.send_json(&ack)?;
                Ok(None)
            }
            SessionState::Streaming if message == COMPLETE_SENTINEL => {
                let length = self.finalize()?;
                if let Err(e) = outbound.send_json(&CompleteAck { ok: true }) {
                    tracing::debug!(error = %e, "Completion ack not delivered");
                }
                Ok(Some(length))
            }
            SessionState::Streaming => {
                self.append(message).await?;
                Ok(None)
            }
            SessionState::Finalized | SessionState::Aborted => Err(UploadError::Disconnected),
        }
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    async fn handshake(&mut self, message: &[u8]) -> Result<HandshakeAck, UploadError> {
        let request: HandshakeRequest = serde_json::from_slice(message)
            .map_err(|e| UploadError::InvalidHandshake(e.to_string()))?;

        let secret = auth::secret_from_authorization(&request.authorization)
            .ok_or_else(|| UploadError::InvalidHandshake("invalid auth secret".to_string()))?;

        let terms = request.terms(&self.limits, Utc::now());

        let record = loop {
            let record = FileRecord::new(
                secret.to_string(),
                request.file_metadata.clone().unwrap_or_default(),
                terms.expire_at,
                terms.download_limit,
                request.has_password,
            );
            if self.store.insert_new(record.clone()) {
                break record;
            }
        };

        // From here on an abort must clean up the record
        self.file_id = Some(record.id.clone());
        self.state = SessionState::Streaming;

        self.blobs.create(&record.id).await?;

        tracing::info!(
            file_id = %record.id,
            download_limit = record.download_limit,
            expire_at = ?record.expire_at,
            password = record.password_protected,
            "Upload started"
        );

        Ok(HandshakeAck {
            url: format!("{}/download/{}", self.public_url, record.id),
            id: record.id,
            owner_token: record.owner_token,
        })
    }

    async fn append(&mut self, chunk: &[u8]) -> Result<(), UploadError> {
        let id = self.file_id.as_deref().ok_or(UploadError::RecordGone)?;
        let size = chunk.len() as u64;

        if self.received.saturating_add(size) > self.limits.max_upload_bytes {
            return Err(UploadError::TooLarge {
                limit: self.limits.max_upload_bytes,
            });
        }

        // A blob removed by the owner mid-upload is not recreated
        self.blobs.append(id, chunk).await.map_err(|e| match e {
            BlobError::NotFound(_) => UploadError::RecordGone,
            e => UploadError::Storage(e),
        })?;

        self.received += size;
        Ok(())
    }

    fn finalize(&mut self) -> Result<u64, UploadError> {
        let id = self.file_id.as_deref().ok_or(UploadError::RecordGone)?;
        let length = self.received;

        self.store
            .update(id, |record| record.length = Some(length))
            .ok_or(UploadError::RecordGone)?;

        self.state = SessionState::Finalized;
        Ok(length)
    }

    async fn abort(&mut self) {
        if self.state == SessionState::Streaming {
            if let Some(id) = &self.file_id {
                self.store.remove(id);
                self.blobs.discard(id).await;
            }
        }
        self.state = SessionState::Aborted;
    }
}
