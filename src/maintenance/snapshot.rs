//! Store snapshots
//!
//! The whole store is written as one JSON object mapping id to record. Writes
//! go to `<path>.tmp` first and are renamed over the snapshot once synced, so
//! a crash mid-write leaves the previous snapshot intact.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::store::{FileRecord, FileStore};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write every record to `path` atomically, returning the record count
pub async fn save(store: &FileStore, path: &Path) -> Result<usize, SnapshotError> {
    let records = store.snapshot();
    let json = serde_json::to_vec(&records)?;
    let tmp = path.with_extension("tmp");

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(io_error(parent))?;
    }

    let mut file = fs::File::create(&tmp).await.map_err(io_error(&tmp))?;
    file.write_all(&json).await.map_err(io_error(&tmp))?;
    if let Err(err) = file.sync_all().await {
        tracing::warn!(?err, path = ?tmp, "Failed to sync snapshot temp file");
    }
    drop(file);

    fs::rename(&tmp, path).await.map_err(io_error(path))?;

    tracing::debug!(records = records.len(), path = ?path, "Snapshot written");
    Ok(records.len())
}

/// Load a snapshot into the store, returning the record count.
///
/// A missing file is an empty store, not an error.
pub async fn restore(store: &FileStore, path: &Path) -> Result<usize, SnapshotError> {
    let data = match fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_error(path)(e)),
    };

    let records: HashMap<String, FileRecord> = serde_json::from_slice(&data)?;
    let count = records.len();
    store.load(records);
    Ok(count)
}
