//! Delayed eviction queue.
//!
//! Writers that update the source of truth evict a key, perform the write,
//! then schedule a second eviction of the same key after a fixed delay. The
//! second eviction removes any stale value a concurrent reader loaded
//! between the first eviction and the end of the write (for example from a
//! lagging read replica).
//!
//! # Worker
//!
//! One tokio task per queue pops the earliest-due task. While nothing is due
//! it sleeps until the head's deadline or until a schedule wakes it. Due
//! removals run inline, or are handed to a [`WorkerPool`] so a slow backend
//! does not hold up the timer for other keys.
//!
//! # Shutdown
//!
//! `stop` drops every pending task and enqueues the reserved `$stop` key,
//! which ends the worker. Delivery is at-least-zero: nothing pending at
//! shutdown is executed. Each worker owns the heap it was started with, so
//! a restart right after `stop` cannot hand the old worker's sentinel to
//! the new one.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bulwark_core::{CacheError, CacheResult};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::pool::WorkerPool;

/// Reserved key that stops the worker.
pub const STOP_COMMAND: &str = "$stop";

/// Whatever removes a key when its delayed eviction comes due.
#[async_trait]
pub trait EvictionTarget: Send + Sync {
    async fn evict(&self, key: &str) -> CacheResult<()>;
}

#[derive(Debug, PartialEq, Eq)]
struct EvictionTask {
    due_at: Instant,
    seq: u64,
    key: String,
}

impl Ord for EvictionTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.due_at
            .cmp(&other.due_at)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for EvictionTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<EvictionTask>>,
    next_seq: u64,
}

impl QueueState {
    fn push(&mut self, key: String, due_at: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(EvictionTask { due_at, seq, key }));
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum Next {
    Due(EvictionTask),
    Until(Instant),
    Idle,
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

/// Deadline `delay` from now, capped about thirty years out.
fn due_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

/// Time-ordered queue of pending evictions drained by one background task.
pub struct DelayEvictionQueue {
    name: String,
    delay_millis: AtomicU64,
    shared: Mutex<Arc<Shared>>,
    target: Arc<dyn EvictionTarget>,
    pool: Option<Arc<dyn WorkerPool>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DelayEvictionQueue {
    /// Create a stopped queue. `name` labels log lines.
    pub fn new(
        name: impl Into<String>,
        delay: Duration,
        target: Arc<dyn EvictionTarget>,
        pool: Option<Arc<dyn WorkerPool>>,
    ) -> Self {
        Self {
            name: name.into(),
            delay_millis: AtomicU64::new(millis(delay)),
            shared: Mutex::new(Arc::new(Shared::default())),
            target,
            pool,
            worker: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_millis.load(Ordering::Acquire))
    }

    /// Change the delay applied to tasks scheduled from now on.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_millis.store(millis(delay), Ordering::Release);
    }

    /// Replace the worker pool used for dispatched removals.
    pub fn set_pool(&mut self, pool: Option<Arc<dyn WorkerPool>>) {
        self.pool = pool;
    }

    /// Schedule an eviction of `key` after the configured delay.
    pub fn schedule_eviction(&self, key: &str) -> CacheResult<()> {
        if key == STOP_COMMAND {
            return Err(CacheError::invalid_argument(
                "key",
                format!("{} is a reserved key", STOP_COMMAND),
            ));
        }
        let due_at = due_after(self.delay());
        let shared = self.current();
        shared.lock().push(key.to_string(), due_at);
        shared.notify.notify_one();
        Ok(())
    }

    /// Number of scheduled evictions not yet taken by the worker.
    pub fn pending(&self) -> usize {
        self.current().lock().heap.len()
    }

    fn shared_slot(&self) -> MutexGuard<'_, Arc<Shared>> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current(&self) -> Arc<Shared> {
        self.shared_slot().clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker_slot()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn worker_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the worker on the current tokio runtime. Idempotent.
    pub fn start(&self) -> CacheResult<()> {
        let mut slot = self.worker_slot();
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return Ok(());
        }
        let handle = Handle::try_current().map_err(|e| {
            CacheError::illegal_state(format!(
                "delay eviction worker for {} needs a tokio runtime: {}",
                self.name, e
            ))
        })?;

        let worker = Worker {
            name: self.name.clone(),
            shared: self.current(),
            target: Arc::clone(&self.target),
            pool: self.pool.clone(),
        };
        *slot = Some(handle.spawn(worker.run()));
        info!(cache = %self.name, "Delay eviction worker started");
        Ok(())
    }

    /// Drop pending evictions and signal the worker to exit.
    pub fn stop(&self) {
        let running = self.worker_slot().take().is_some();
        let retired = std::mem::replace(&mut *self.shared_slot(), Arc::new(Shared::default()));
        {
            let mut state = retired.lock();
            let dropped = state.heap.len();
            state.heap.clear();
            if running {
                state.push(STOP_COMMAND.to_string(), Instant::now());
            }
            if dropped > 0 {
                debug!(cache = %self.name, dropped, "Dropped pending delayed evictions");
            }
        }
        retired.notify.notify_one();
        if running {
            info!(cache = %self.name, "Delay eviction worker stopping");
        }
    }
}

impl Drop for DelayEvictionQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.worker_slot().take() {
            handle.abort();
        }
    }
}

struct Worker {
    name: String,
    shared: Arc<Shared>,
    target: Arc<dyn EvictionTarget>,
    pool: Option<Arc<dyn WorkerPool>>,
}

impl Worker {
    async fn run(self) {
        loop {
            let next = {
                let mut state = self.shared.lock();
                let now = Instant::now();
                match state.heap.peek() {
                    None => Next::Idle,
                    Some(Reverse(head)) if head.due_at <= now => match state.heap.pop() {
                        Some(Reverse(task)) => Next::Due(task),
                        None => Next::Idle,
                    },
                    Some(Reverse(head)) => Next::Until(head.due_at),
                }
            };

            match next {
                Next::Due(task) => {
                    if task.key == STOP_COMMAND {
                        break;
                    }
                    self.dispatch(task.key).await;
                }
                Next::Until(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = self.shared.notify.notified() => {}
                    }
                }
                Next::Idle => self.shared.notify.notified().await,
            }
        }
        info!(cache = %self.name, "Delay eviction worker stopped");
    }

    async fn dispatch(&self, key: String) {
        debug!(cache = %self.name, key = %key, "Delayed eviction due");
        match &self.pool {
            Some(pool) => {
                let name = self.name.clone();
                let target = Arc::clone(&self.target);
                pool.submit(Box::pin(async move {
                    evict_logged(&name, target.as_ref(), &key).await;
                }));
            }
            None => evict_logged(&self.name, self.target.as_ref(), &key).await,
        }
    }
}

async fn evict_logged(name: &str, target: &dyn EvictionTarget, key: &str) {
    if let Err(e) = target.evict(key).await {
        warn!(cache = %name, key = %key, error = %e, "Delayed eviction failed");
    }
}
