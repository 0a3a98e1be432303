//! Background maintenance
//!
//! Two periodic loops run on the background pool until shutdown:
//! - the janitor reaps expired records and their blobs
//! - the snapshotter persists the store to disk
//!
//! A failed iteration is logged and the loop carries on with the next tick.

pub mod janitor;
pub mod snapshot;

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::admission::PoolSaturated;
use crate::state::AppState;

pub use janitor::{integrity_sweep, reap_expired, IntegrityReport};
pub use snapshot::SnapshotError;

/// Spawn both loops. They stop when `shutdown` is cancelled.
pub fn spawn_loops(state: &AppState, shutdown: &CancellationToken) -> Result<(), PoolSaturated> {
    let maintenance = &state.config().maintenance;

    let janitor_state = state.clone();
    let janitor_every = Duration::from_secs(maintenance.janitor_interval_secs.max(1));
    let janitor_shutdown = shutdown.clone();
    state.background_pool().spawn("janitor", async move {
        run_janitor(janitor_state, janitor_every, janitor_shutdown).await;
    })?;

    let snapshot_state = state.clone();
    let snapshot_every = Duration::from_secs(maintenance.snapshot_interval_secs.max(1));
    let snapshot_shutdown = shutdown.clone();
    state.background_pool().spawn("snapshotter", async move {
        run_snapshots(snapshot_state, snapshot_every, snapshot_shutdown).await;
    })?;

    Ok(())
}

/// Ticker whose first tick is one period from now
fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn run_janitor(state: AppState, period: Duration, shutdown: CancellationToken) {
    let mut interval = ticker(period);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let reaped = reap_expired(state.store(), state.blobs(), Utc::now()).await;
        if reaped > 0 {
            let remaining = state.store().len();
            tracing::info!(reaped, remaining, "Janitor removed expired files");
        } else {
            tracing::debug!("Janitor found nothing to remove");
        }
    }

    tracing::debug!("Janitor stopped");
}

async fn run_snapshots(state: AppState, period: Duration, shutdown: CancellationToken) {
    let mut interval = ticker(period);
    let path: PathBuf = state.config().storage.snapshot_path.clone();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        if let Err(e) = snapshot::save(state.store(), &path).await {
            tracing::error!(error = %e, "Periodic snapshot failed");
        }
    }

    tracing::debug!("Snapshotter stopped");
}
