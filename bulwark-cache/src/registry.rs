//! Registry of named cache instances.
//!
//! The registry is an explicitly constructed object: the application builds
//! one, registers its caches, starts it at boot and stops it at shutdown.
//! Caches start in registration order and stop in reverse order. Before a
//! cache is started by the registry, the registry policy (statistics,
//! breakdown prevention, negative TTL) is applied to its settings.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bulwark_core::{CacheError, CacheResult, CacheSettings, RegistryConfig, RegistryPolicy};
use tracing::{error, info};

use crate::backend::CacheBackend;
use crate::cache::Cache;
use crate::stats::CacheStatsSnapshot;

/// Type-erased view of a cache instance, as held by a [`CacheRegistry`].
pub trait ManagedCache: Send + Sync {
    fn name(&self) -> &str;

    /// Backend identifier.
    fn kind(&self) -> &'static str;

    fn is_started(&self) -> bool;

    /// Overwrite the policy-owned settings. Fails while started.
    fn apply_policy(&self, policy: &RegistryPolicy) -> CacheResult<()>;

    fn start(&self) -> CacheResult<()>;

    fn stop(&self);

    fn stats_snapshot(&self) -> CacheStatsSnapshot;

    /// Upcast for [`CacheRegistry::get_typed`].
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T, B> ManagedCache for Cache<T, B>
where
    T: Clone + Send + Sync + 'static,
    B: CacheBackend<T> + 'static,
{
    fn name(&self) -> &str {
        Cache::name(self)
    }

    fn kind(&self) -> &'static str {
        Cache::kind(self)
    }

    fn is_started(&self) -> bool {
        Cache::is_started(self)
    }

    fn apply_policy(&self, policy: &RegistryPolicy) -> CacheResult<()> {
        self.configure(|settings| policy.apply_to(settings))
    }

    fn start(&self) -> CacheResult<()> {
        Cache::start(self)
    }

    fn stop(&self) {
        Cache::stop(self)
    }

    fn stats_snapshot(&self) -> CacheStatsSnapshot {
        Cache::stats_snapshot(self)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Lifecycle container for named caches.
pub struct CacheRegistry {
    policy: RegistryPolicy,
    caches: RwLock<Vec<Arc<dyn ManagedCache>>>,
    started: AtomicBool,
    lifecycle: Mutex<()>,
}

impl CacheRegistry {
    /// Create an empty, stopped registry.
    pub fn new(policy: RegistryPolicy) -> CacheResult<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            caches: RwLock::new(Vec::new()),
            started: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        })
    }

    /// Build a registry from a declarative config. `factory` turns each
    /// cache's settings into an instance (choosing its backend).
    pub fn from_config<F>(config: &RegistryConfig, mut factory: F) -> CacheResult<Self>
    where
        F: FnMut(&CacheSettings) -> CacheResult<Arc<dyn ManagedCache>>,
    {
        config.validate()?;
        let registry = Self::new(config.policy.clone())?;
        for settings in &config.caches {
            let cache = factory(settings)?;
            registry.add_cache(cache)?;
        }
        Ok(registry)
    }

    pub fn policy(&self) -> &RegistryPolicy {
        &self.policy
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn read_caches(&self) -> RwLockReadGuard<'_, Vec<Arc<dyn ManagedCache>>> {
        self.caches.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_caches(&self) -> RwLockWriteGuard<'_, Vec<Arc<dyn ManagedCache>>> {
        self.caches.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lifecycle_guard(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a cache. Returns `false` if a cache with the same name is
    /// already registered.
    ///
    /// When the registry is started the cache is brought up immediately:
    /// the policy is applied and the cache started. If that fails the cache
    /// is not registered.
    pub fn add_cache(&self, cache: Arc<dyn ManagedCache>) -> CacheResult<bool> {
        let _lifecycle = self.lifecycle_guard();
        if self.read_caches().iter().any(|c| c.name() == cache.name()) {
            return Ok(false);
        }

        if self.is_started() {
            self.bring_up(cache.as_ref())?;
        }
        info!(cache = %cache.name(), kind = cache.kind(), "Cache registered");
        self.write_caches().push(cache);
        Ok(true)
    }

    /// Stop and unregister a cache.
    pub fn remove_cache(&self, name: &str) -> Option<Arc<dyn ManagedCache>> {
        let _lifecycle = self.lifecycle_guard();
        let removed = {
            let mut caches = self.write_caches();
            let index = caches.iter().position(|c| c.name() == name)?;
            caches.remove(index)
        };
        removed.stop();
        info!(cache = %name, "Cache unregistered");
        Some(removed)
    }

    pub fn get_cache(&self, name: &str) -> Option<Arc<dyn ManagedCache>> {
        self.read_caches()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Look up a cache by name and concrete type.
    pub fn get_typed<T, B>(&self, name: &str) -> Option<Arc<Cache<T, B>>>
    where
        T: Clone + Send + Sync + 'static,
        B: CacheBackend<T> + 'static,
    {
        self.get_cache(name)?.as_any().downcast::<Cache<T, B>>().ok()
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.read_caches()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read_caches().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_caches().is_empty()
    }

    fn bring_up(&self, cache: &dyn ManagedCache) -> CacheResult<()> {
        if cache.is_started() {
            return Ok(());
        }
        cache.apply_policy(&self.policy)?;
        cache.start()
    }

    /// Start every registered cache in registration order.
    ///
    /// Every cache is attempted; the first failure is returned after the
    /// rest have been tried. The registry counts as started either way so a
    /// later `stop` tears down whatever did come up.
    pub fn start(&self) -> CacheResult<()> {
        let _lifecycle = self.lifecycle_guard();
        if self.is_started() {
            return Ok(());
        }
        info!(caches = self.len(), "Cache registry is starting");

        let caches: Vec<_> = self.read_caches().clone();
        let mut first_error: Option<CacheError> = None;
        for cache in &caches {
            if let Err(e) = self.bring_up(cache.as_ref()) {
                error!(cache = %cache.name(), error = %e, "Failed to start cache");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        self.started.store(true, Ordering::Release);

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Cache registry is started");
                Ok(())
            }
        }
    }

    /// Stop every registered cache in reverse registration order.
    pub fn stop(&self) {
        let _lifecycle = self.lifecycle_guard();
        if !self.is_started() {
            return;
        }
        info!("Cache registry is stopping");

        let caches: Vec<_> = self.read_caches().clone();
        for cache in caches.iter().rev() {
            cache.stop();
        }
        self.started.store(false, Ordering::Release);
        info!("Cache registry is stopped");
    }
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("policy", &self.policy)
            .field("caches", &self.names())
            .field("started", &self.is_started())
            .finish()
    }
}
