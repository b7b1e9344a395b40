//! bulwark cache - backend-agnostic cache core
//!
//! A [`Cache`] wraps a pluggable [`CacheBackend`] with:
//! - input validation and per-instance hit / negative-hit / miss statistics
//! - read-through loading with stampede protection (a local load lock plus an
//!   optional [`DistributedLock`])
//! - negative caching of confirmed absences ("breakdown prevention")
//! - evict-then-write-then-evict-again consistency via a
//!   [`DelayEvictionQueue`]
//!
//! [`CacheRegistry`] starts and stops a set of named caches together.
//!
//! ```ignore
//! let backend = Arc::new(InMemoryBackend::new());
//! let orders = Arc::new(Cache::new(CacheSettings::new("orders").with_expiry_secs(60), backend)?);
//!
//! let registry = CacheRegistry::new(RegistryPolicy::from_env())?;
//! registry.add_cache(orders.clone())?;
//! registry.start()?;
//!
//! let order = orders.get_or_load("order:1", &loader).await?;
//! ```

pub mod backend;
pub mod cache;
pub mod eviction;
pub mod lifecycle;
pub mod loader;
pub mod lock;
pub mod memory;
pub mod pool;
pub mod registry;
pub mod stats;

pub use backend::{CacheBackend, NEGATIVE_MARKER};
pub use cache::Cache;
pub use eviction::{DelayEvictionQueue, EvictionTarget, STOP_COMMAND};
pub use lifecycle::LifecycleListener;
pub use loader::{BatchLoader, Loader};
pub use lock::{lock_name_for, DistributedLock, LockGuard};
pub use memory::InMemoryBackend;
pub use pool::{Job, TokioWorkerPool, WorkerPool};
pub use registry::{CacheRegistry, ManagedCache};
pub use stats::{CacheStats, CacheStatsSnapshot};

pub use bulwark_core::{
    validate_key, CacheError, CacheResult, CacheSettings, CacheState, CachedObject, KeyBuilder,
    RegistryConfig, RegistryPolicy,
};
