//! Local filesystem blob storage

use std::io::ErrorKind;
use std::path::PathBuf;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::{BlobError, BlobReader, BlobStorage};

/// Extension of blob files
const BLOB_EXTENSION: &str = "bin";

/// Read buffer for streaming downloads (64 KiB)
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Local filesystem blob storage
pub struct LocalBlobStorage {
    base_path: PathBuf,
}

impl LocalBlobStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.base_path.join(format!("{}.{}", id, BLOB_EXTENSION))
    }

    fn not_found(id: &str, e: std::io::Error) -> BlobError {
        if e.kind() == ErrorKind::NotFound {
            BlobError::NotFound(id.to_string())
        } else {
            BlobError::Io(e)
        }
    }
}

#[async_trait::async_trait]
impl BlobStorage for LocalBlobStorage {
    async fn create(&self, id: &str) -> Result<(), BlobError> {
        fs::create_dir_all(&self.base_path).await?;
        fs::File::create(self.blob_path(id)).await?;
        Ok(())
    }

    async fn append(&self, id: &str, data: &[u8]) -> Result<(), BlobError> {
        // No `create(true)`: a blob removed mid-upload must not come back
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(self.blob_path(id))
            .await
            .map_err(|e| Self::not_found(id, e))?;

        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool, BlobError> {
        match fs::remove_file(self.blob_path(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn open(&self, id: &str) -> Result<BlobReader, BlobError> {
        let file = fs::File::open(self.blob_path(id))
            .await
            .map_err(|e| Self::not_found(id, e))?;
        let length = file.metadata().await?.len();

        Ok(BlobReader {
            length,
            stream: Box::pin(ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE)),
        })
    }

    async fn list_ids(&self) -> Result<Vec<String>, BlobError> {
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }

        Ok(ids)
    }
}
