//! Application state management

use std::sync::Arc;

use crate::admission::WorkerPool;
use crate::blob::BlobStore;
use crate::config::Config;
use crate::store::FileStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    store: FileStore,
    blobs: BlobStore,
    http_pool: WorkerPool,
    background_pool: WorkerPool,
}

impl AppState {
    /// Build state with an empty store and local blob storage under `data_dir`
    pub fn new(config: Config) -> Self {
        let store = FileStore::with_shards(config.storage.shards);
        let blobs = BlobStore::with_local_storage(config.storage.data_dir.clone());
        Self::with_parts(config, store, blobs)
    }

    pub fn with_parts(config: Config, store: FileStore, blobs: BlobStore) -> Self {
        let http_pool = WorkerPool::new("http", config.server.http_workers);
        let background_pool = WorkerPool::new("background", config.server.background_workers);

        Self {
            inner: Arc::new(AppStateInner {
                config,
                store,
                blobs,
                http_pool,
                background_pool,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the metadata store
    pub fn store(&self) -> &FileStore {
        &self.inner.store
    }

    /// Get the blob store
    pub fn blobs(&self) -> &BlobStore {
        &self.inner.blobs
    }

    /// Pool gating HTTP requests
    pub fn http_pool(&self) -> &WorkerPool {
        &self.inner.http_pool
    }

    /// Pool running detached tasks
    pub fn background_pool(&self) -> &WorkerPool {
        &self.inner.background_pool
    }
}
