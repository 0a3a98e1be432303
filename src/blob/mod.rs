//! Blob Storage
//!
//! Durable storage for uploaded file contents, keyed by file id. The store is
//! a thin handle over a pluggable [`BlobStorage`] backend; the local filesystem
//! backend keeps one `<id>.bin` file per transfer.

mod local;

pub use local::LocalBlobStorage;

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;

// ============================================================================
// Types
// ============================================================================

/// Streaming blob contents
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Blob opened for reading
pub struct BlobReader {
    /// Size on disk
    pub length: u64,
    pub stream: ByteStream,
}

/// Blob storage errors
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid blob id: {0}")]
    InvalidId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Backend Trait
// ============================================================================

/// Trait for blob storage backends
#[async_trait::async_trait]
pub trait BlobStorage: Send + Sync {
    /// Create (or truncate) an empty blob
    async fn create(&self, id: &str) -> Result<(), BlobError>;

    /// Append bytes to an existing blob
    async fn append(&self, id: &str, data: &[u8]) -> Result<(), BlobError>;

    /// Remove a blob, returning whether it existed
    async fn remove(&self, id: &str) -> Result<bool, BlobError>;

    /// Open a blob as a byte stream
    async fn open(&self, id: &str) -> Result<BlobReader, BlobError>;

    /// Ids of every stored blob
    async fn list_ids(&self) -> Result<Vec<String>, BlobError>;
}

// ============================================================================
// Blob Store
// ============================================================================

/// Shared blob store handle
#[derive(Clone)]
pub struct BlobStore {
    backend: Arc<dyn BlobStorage>,
}

impl BlobStore {
    /// Create with local filesystem storage
    pub fn with_local_storage(base_path: PathBuf) -> Self {
        Self::with_backend(Arc::new(LocalBlobStorage::new(base_path)))
    }

    pub fn with_backend(backend: Arc<dyn BlobStorage>) -> Self {
        Self { backend }
    }

    pub async fn create(&self, id: &str) -> Result<(), BlobError> {
        validate_id(id)?;
        self.backend.create(id).await
    }

    pub async fn append(&self, id: &str, data: &[u8]) -> Result<(), BlobError> {
        validate_id(id)?;
        self.backend.append(id, data).await
    }

    pub async fn remove(&self, id: &str) -> Result<bool, BlobError> {
        validate_id(id)?;
        self.backend.remove(id).await
    }

    /// Remove a blob, logging instead of failing.
    ///
    /// Used on cleanup paths where the record is already gone.
    pub async fn discard(&self, id: &str) {
        match self.remove(id).await {
            Ok(true) => tracing::debug!(file_id = %id, "Removed blob"),
            Ok(false) => {}
            Err(e) => tracing::warn!(file_id = %id, error = %e, "Failed to remove blob"),
        }
    }

    pub async fn open(&self, id: &str) -> Result<BlobReader, BlobError> {
        validate_id(id)?;
        self.backend.open(id).await
    }

    pub async fn list_ids(&self) -> Result<Vec<String>, BlobError> {
        self.backend.list_ids().await
    }
}

/// Ids reach the filesystem, so only plain alphanumerics are accepted
fn validate_id(id: &str) -> Result<(), BlobError> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(BlobError::InvalidId(id.to_string()));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
