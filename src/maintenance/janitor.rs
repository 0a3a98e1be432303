//! Expiry reaping and the startup integrity sweep

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::blob::{BlobError, BlobStore};
use crate::store::FileStore;

/// Remove every record expired at `now` together with its blob.
///
/// Records are re-checked under their shard lock before removal, so one that
/// was concurrently deleted or replaced is left alone.
pub async fn reap_expired(store: &FileStore, blobs: &BlobStore, now: DateTime<Utc>) -> usize {
    let mut expired = Vec::new();
    store.for_each(|record| {
        if record.is_expired(now) {
            expired.push(record.id.clone());
        }
    });

    let mut reaped = 0;
    for id in expired {
        if store.remove_if(&id, |record| record.is_expired(now)).is_some() {
            blobs.discard(&id).await;
            reaped += 1;
        }
    }
    reaped
}

/// What the integrity sweep removed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Blobs with no record
    pub orphaned_blobs: usize,
    /// Records whose upload never finished
    pub incomplete_records: usize,
    /// Finished records whose blob is gone
    pub missing_blobs: usize,
}

impl IntegrityReport {
    pub fn total(&self) -> usize {
        self.orphaned_blobs + self.incomplete_records + self.missing_blobs
    }
}

/// Bring records and blobs back in line after a restart.
///
/// Must run before the server accepts uploads: an upload in progress looks
/// exactly like one interrupted by a crash.
pub async fn integrity_sweep(
    store: &FileStore,
    blobs: &BlobStore,
) -> Result<IntegrityReport, BlobError> {
    let blob_ids: HashSet<String> = blobs.list_ids().await?.into_iter().collect();
    let mut report = IntegrityReport::default();

    let mut known = HashSet::new();
    let mut incomplete = Vec::new();
    let mut missing = Vec::new();
    store.for_each(|record| {
        known.insert(record.id.clone());
        if !record.is_complete() {
            incomplete.push(record.id.clone());
        } else if !blob_ids.contains(&record.id) {
            missing.push(record.id.clone());
        }
    });

    for id in incomplete {
        store.remove(&id);
        blobs.discard(&id).await;
        report.incomplete_records += 1;
    }

    for id in missing {
        store.remove(&id);
        report.missing_blobs += 1;
    }

    for id in blob_ids {
        if !known.contains(&id) {
            blobs.discard(&id).await;
            report.orphaned_blobs += 1;
        }
    }

    Ok(report)
}
