//! Sharded Metadata Store
//!
//! In-memory map from file id to [`FileRecord`], partitioned into independently
//! locked shards. Every read-modify-write on one record runs inside that
//! record's shard lock, so concurrent requests for one id are serialized while
//! requests for different shards never contend.

mod record;

pub use record::*;

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::Arc;

use parking_lot::Mutex;

/// Default number of shards
pub const DEFAULT_SHARD_COUNT: usize = 32;

type Shard = Mutex<HashMap<String, FileRecord>>;

/// Outcome of [`FileStore::compare_and_rotate_nonce`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceRotation {
    /// Expected nonce matched and was replaced
    Rotated(Nonce),
    /// Stored nonce differs from the expected one, left untouched
    Mismatch(Nonce),
    /// No record under this id
    Missing,
}

/// Concurrent file record store
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<FileStoreInner>,
}

struct FileStoreInner {
    shards: Box<[Shard]>,
    hasher: RandomState,
}

impl FileStore {
    /// Create a store with [`DEFAULT_SHARD_COUNT`] shards
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARD_COUNT)
    }

    /// Create a store with a custom shard count (at least one)
    pub fn with_shards(count: usize) -> Self {
        let shards = (0..count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            inner: Arc::new(FileStoreInner {
                shards,
                hasher: RandomState::new(),
            }),
        }
    }

    fn shard(&self, id: &str) -> &Shard {
        let index = self.inner.hasher.hash_one(id) as usize % self.inner.shards.len();
        &self.inner.shards[index]
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    // ========================================================================
    // Basic Operations
    // ========================================================================

    /// Get a copy of a record
    pub fn get(&self, id: &str) -> Option<FileRecord> {
        self.shard(id).lock().get(id).cloned()
    }

    /// Insert or replace a record
    pub fn set(&self, id: &str, record: FileRecord) {
        self.shard(id).lock().insert(id.to_string(), record);
    }

    /// Insert a record under its own id unless that id is already taken
    pub fn insert_new(&self, record: FileRecord) -> bool {
        let mut shard = self.shard(&record.id).lock();
        if shard.contains_key(&record.id) {
            return false;
        }
        shard.insert(record.id.clone(), record);
        true
    }

    /// Remove a record, returning it if it existed
    pub fn remove(&self, id: &str) -> Option<FileRecord> {
        self.shard(id).lock().remove(id)
    }

    /// Remove a record only if it still satisfies `predicate`
    pub fn remove_if<F>(&self, id: &str, predicate: F) -> Option<FileRecord>
    where
        F: FnOnce(&FileRecord) -> bool,
    {
        let mut shard = self.shard(id).lock();
        if shard.get(id).is_some_and(predicate) {
            shard.remove(id)
        } else {
            None
        }
    }

    /// Run `f` against a record while holding its shard lock.
    ///
    /// `f` must not call back into the store.
    pub fn update<T, F>(&self, id: &str, f: F) -> Option<T>
    where
        F: FnOnce(&mut FileRecord) -> T,
    {
        let mut shard = self.shard(id).lock();
        shard.get_mut(id).map(f)
    }

    /// Rotate the nonce if it still equals `expected`
    pub fn compare_and_rotate_nonce(&self, id: &str, expected: &Nonce) -> NonceRotation {
        self.update(id, |record| {
            if record.nonce == *expected {
                NonceRotation::Rotated(record.rotate_nonce())
            } else {
                NonceRotation::Mismatch(record.nonce)
            }
        })
        .unwrap_or(NonceRotation::Missing)
    }

    /// Claim one download slot, returning the updated record
    pub fn increment_download(&self, id: &str) -> Option<Result<FileRecord, LimitReached>> {
        self.update(id, |record| record.claim_download().map(|()| record.clone()))
    }

    /// Undo one [`increment_download`](Self::increment_download)
    pub fn release_download(&self, id: &str) -> Option<u32> {
        self.update(id, |record| {
            record.release_download();
            record.download_count
        })
    }

    // ========================================================================
    // Iteration
    // ========================================================================

    /// Visit every record.
    ///
    /// Each shard is copied under its lock and visited after the lock is
    /// released, so the view is only consistent per shard.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&FileRecord),
    {
        for shard in self.inner.shards.iter() {
            let records: Vec<FileRecord> = shard.lock().values().cloned().collect();
            for record in &records {
                visitor(record);
            }
        }
    }

    /// Copy of every record, keyed by id
    pub fn snapshot(&self) -> HashMap<String, FileRecord> {
        let mut all = HashMap::with_capacity(self.len());
        for shard in self.inner.shards.iter() {
            let shard = shard.lock();
            all.extend(shard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        all
    }

    /// Insert every record of a snapshot
    pub fn load(&self, records: HashMap<String, FileRecord>) {
        for (id, record) in records {
            self.set(&id, record);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FileStore {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
