//! Admission control
//!
//! Fixed-capacity worker pools. Work arriving while a pool is saturated is
//! refused immediately instead of queued:
//! - the HTTP pool gates every request through [`admission_middleware`] and
//!   answers 503 when full
//! - the background pool runs detached tasks (maintenance loops, channel
//!   pumps, upload sessions) that each hold a slot for their whole lifetime

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::AppError;

/// Returned when a pool has no free slot
#[derive(Debug, Clone, thiserror::Error)]
#[error("worker pool '{pool}' saturated ({capacity} slots)")]
pub struct PoolSaturated {
    pub pool: &'static str,
    pub capacity: usize,
}

/// Bounded worker pool
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<WorkerPoolInner>,
}

struct WorkerPoolInner {
    name: &'static str,
    capacity: usize,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(WorkerPoolInner {
                name,
                capacity,
                permits: Arc::new(Semaphore::new(capacity)),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Slots currently in use
    pub fn in_flight(&self) -> usize {
        self.inner.capacity - self.inner.permits.available_permits()
    }

    /// Take a slot without waiting
    pub fn try_acquire(&self) -> Result<OwnedSemaphorePermit, PoolSaturated> {
        self.inner
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| PoolSaturated {
                pool: self.inner.name,
                capacity: self.inner.capacity,
            })
    }

    /// Run a detached task holding one slot until it finishes
    pub fn spawn<F>(&self, task: &'static str, future: F) -> Result<JoinHandle<()>, PoolSaturated>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self.try_acquire()?;
        let span = tracing::debug_span!("task", pool = self.inner.name, task);

        Ok(tokio::spawn(
            async move {
                future.await;
                drop(permit);
            }
            .instrument(span),
        ))
    }
}

/// Admit a request only if the HTTP pool has a free slot.
///
/// The slot is held until the handler has produced its response.
pub async fn admission_middleware(
    State(pool): State<WorkerPool>,
    request: Request,
    next: Next,
) -> Response {
    let _permit = match pool.try_acquire() {
        Ok(permit) => permit,
        Err(e) => {
            tracing::warn!(path = %request.uri().path(), "Rejecting request: {}", e);
            return AppError::Overloaded.into_response();
        }
    };

    next.run(request).await
}
