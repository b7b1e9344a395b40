//! Worker pool collaborator for dispatched evictions.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bulwark_core::{CacheError, CacheResult};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

/// A unit of fire-and-forget work.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Executes jobs off the caller's task.
pub trait WorkerPool: Send + Sync {
    fn submit(&self, job: Job);
}

/// Bounded pool on a tokio runtime.
///
/// Jobs are spawned immediately and wait for one of `max_workers` permits,
/// so at most `max_workers` run at the same time.
#[derive(Debug, Clone)]
pub struct TokioWorkerPool {
    handle: Handle,
    permits: Arc<Semaphore>,
    max_workers: usize,
    in_flight: Arc<AtomicUsize>,
}

impl TokioWorkerPool {
    /// Create a pool on the current runtime.
    pub fn new(max_workers: usize) -> CacheResult<Self> {
        let handle = Handle::try_current()
            .map_err(|e| CacheError::illegal_state(format!("no tokio runtime: {}", e)))?;
        Ok(Self::with_handle(handle, max_workers))
    }

    /// Create a pool sized to the available parallelism.
    pub fn with_default_size() -> CacheResult<Self> {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(workers)
    }

    /// Create a pool on an explicit runtime.
    pub fn with_handle(handle: Handle, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            handle,
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Jobs submitted and not yet finished (running or waiting).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WorkerPool for TokioWorkerPool {
    fn submit(&self, job: Job) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlight(Arc::clone(&self.in_flight));
        let permits = Arc::clone(&self.permits);
        self.handle.spawn(async move {
            let _guard = guard;
            // The semaphore is never closed.
            if let Ok(_permit) = permits.acquire_owned().await {
                job.await;
            }
        });
    }
}
