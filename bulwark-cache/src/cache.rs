//! Cache core: validation, statistics, stampede protection and delayed
//! eviction on top of a pluggable [`CacheBackend`].
//!
//! # Load path
//!
//! A miss in [`Cache::get_or_load`] takes the instance-wide load lock,
//! re-reads the backend, optionally takes a distributed lock and re-reads
//! again, and only then calls the loader. Concurrent callers for the same
//! key therefore run the loader at most once per instance. The lock is one
//! per instance, not per key: misses on different keys also queue behind a
//! running loader.
//!
//! A loader that finds nothing stores a negative marker when breakdown
//! prevention is enabled, so the next lookups are answered from the cache
//! until the marker expires.
//!
//! # Consistency on writes
//!
//! Prefer evicting over updating: [`Cache::delay_remove`] evicts the key,
//! runs the write, then schedules a second eviction after
//! `delay_eviction_millis` to drop any stale value a concurrent reader
//! loaded in between.
//!
//! # Stopped instances
//!
//! A stopped cache is a pass-through: reads go straight to the loader (or
//! return nothing), writes and removals do nothing.

use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};
use std::time::Duration;

use async_trait::async_trait;
use bulwark_core::{validate_key, CacheError, CacheResult, CacheSettings, CacheState, CachedObject};
use tracing::{debug, info};

use crate::backend::CacheBackend;
use crate::eviction::{DelayEvictionQueue, EvictionTarget, STOP_COMMAND};
use crate::lifecycle::{notify_started, notify_stopping, LifecycleListener};
use crate::loader::{BatchLoader, Loader};
use crate::lock::{lock_name_for, DistributedLock};
use crate::pool::WorkerPool;
use crate::stats::{CacheStats, CacheStatsSnapshot};

/// Removes keys from the backend on behalf of the eviction worker.
struct BackendEvictor<T, B> {
    backend: Arc<B>,
    _value: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, B> EvictionTarget for BackendEvictor<T, B>
where
    T: Send + Sync + 'static,
    B: CacheBackend<T> + 'static,
{
    async fn evict(&self, key: &str) -> CacheResult<()> {
        self.backend.remove(key).await
    }
}

/// A named cache instance over backend `B` holding values of type `T`.
///
/// Instances compare and hash by name.
pub struct Cache<T, B>
where
    T: Clone + Send + Sync + 'static,
    B: CacheBackend<T> + 'static,
{
    name: String,
    settings: RwLock<CacheSettings>,
    started: AtomicBool,
    lifecycle: Mutex<()>,
    backend: Arc<B>,
    stats: CacheStats,
    load_lock: tokio::sync::Mutex<()>,
    distributed_lock: Option<Arc<dyn DistributedLock>>,
    eviction: DelayEvictionQueue,
    listeners: RwLock<Vec<Arc<dyn LifecycleListener>>>,
    _value: PhantomData<fn() -> T>,
}

impl<T, B> Cache<T, B>
where
    T: Clone + Send + Sync + 'static,
    B: CacheBackend<T> + 'static,
{
    /// Create a stopped cache. Fails if the settings are invalid.
    pub fn new(settings: CacheSettings, backend: Arc<B>) -> CacheResult<Self> {
        settings.validate()?;
        let evictor: Arc<dyn EvictionTarget> = Arc::new(BackendEvictor {
            backend: Arc::clone(&backend),
            _value: PhantomData,
        });
        let eviction = DelayEvictionQueue::new(
            settings.name.clone(),
            Duration::from_millis(settings.delay_eviction_millis),
            evictor,
            None,
        );

        Ok(Self {
            name: settings.name.clone(),
            settings: RwLock::new(settings),
            started: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            backend,
            stats: CacheStats::new(),
            load_lock: tokio::sync::Mutex::new(()),
            distributed_lock: None,
            eviction,
            listeners: RwLock::new(Vec::new()),
            _value: PhantomData,
        })
    }

    /// Guard the load path with a lock shared across processes.
    pub fn with_distributed_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.distributed_lock = Some(lock);
        self
    }

    /// Run delayed evictions on `pool` instead of the eviction worker.
    pub fn with_worker_pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.eviction.set_pool(Some(pool));
        self
    }

    // ========================================================================
    // IDENTITY AND CONFIGURATION
    // ========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> String {
        self.read_settings().effective_description().to_string()
    }

    /// Backend identifier, e.g. `"memory"`.
    pub fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Copy of the current settings.
    pub fn settings(&self) -> CacheSettings {
        self.read_settings().clone()
    }

    fn read_settings(&self) -> RwLockReadGuard<'_, CacheSettings> {
        self.settings.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Change settings. Only allowed while stopped; the name cannot change.
    pub fn configure(&self, f: impl FnOnce(&mut CacheSettings)) -> CacheResult<()> {
        let _lifecycle = self.lifecycle_guard();
        if self.is_started() {
            return Err(CacheError::illegal_state(format!(
                "cache {} cannot be reconfigured while started",
                self.name
            )));
        }

        let mut next = self.settings();
        f(&mut next);
        if next.name != self.name {
            return Err(CacheError::invalid_argument(
                "name",
                "the name of a cache cannot change",
            ));
        }
        next.validate()?;

        self.eviction
            .set_delay(Duration::from_millis(next.delay_eviction_millis));
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = next;
        Ok(())
    }

    /// Register a lifecycle listener.
    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    fn listeners(&self) -> Vec<Arc<dyn LifecycleListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    fn lifecycle_guard(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Start the instance. Starting a started instance does nothing.
    ///
    /// Spawns the delayed-eviction worker when delayed eviction is enabled,
    /// which requires a tokio runtime.
    pub fn start(&self) -> CacheResult<()> {
        let _lifecycle = self.lifecycle_guard();
        if self.is_started() {
            return Ok(());
        }

        let settings = self.settings();
        settings.validate()?;
        info!(cache = %self.name, kind = self.kind(), "Cache is starting");

        if settings.delay_eviction_millis > 0 {
            self.eviction.start()?;
        }
        self.started.store(true, Ordering::Release);
        notify_started(&self.listeners(), &self.name);

        info!(cache = %self.name, "Cache is started");
        Ok(())
    }

    /// Stop the instance. Best effort: never fails, pending delayed
    /// evictions are dropped.
    pub fn stop(&self) {
        let _lifecycle = self.lifecycle_guard();
        if !self.is_started() {
            return;
        }

        info!(cache = %self.name, "Cache is stopping");
        notify_stopping(&self.listeners(), &self.name);
        self.eviction.stop();
        self.started.store(false, Ordering::Release);
        info!(cache = %self.name, "Cache is stopped");
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Store a value with the configured expiry.
    pub async fn put(&self, key: &str, value: T) -> CacheResult<()> {
        let ttl = self.read_settings().expiry_secs;
        self.put_with_ttl(key, value, ttl).await
    }

    /// Store a value with an explicit expiry in seconds (0 = never).
    pub async fn put_with_ttl(&self, key: &str, value: T, ttl_secs: u64) -> CacheResult<()> {
        if !self.is_started() {
            return Ok(());
        }
        validate_key(key)?;
        self.validate_value(&value)?;
        self.backend.put(key, value, ttl_secs).await
    }

    /// Store several values with the configured expiry.
    pub async fn put_many<I>(&self, values: I) -> CacheResult<()>
    where
        I: IntoIterator<Item = (String, T)>,
    {
        let ttl = self.read_settings().expiry_secs;
        self.put_many_with_ttl(values, ttl).await
    }

    /// Store several values. Not atomic: a backend failure part-way may
    /// leave a subset written.
    pub async fn put_many_with_ttl<I>(&self, values: I, ttl_secs: u64) -> CacheResult<()>
    where
        I: IntoIterator<Item = (String, T)>,
    {
        if !self.is_started() {
            return Ok(());
        }
        let values: Vec<(String, T)> = values.into_iter().collect();
        if values.is_empty() {
            return Err(CacheError::invalid_argument("values", "the values are empty"));
        }
        for (key, value) in &values {
            validate_key(key)?;
            self.validate_value(value)?;
        }
        self.backend.put_many(values, ttl_secs).await
    }

    fn validate_value(&self, value: &T) -> CacheResult<()> {
        if self.backend.is_negative_marker(value) {
            return Err(CacheError::invalid_argument(
                "value",
                "the value collides with the negative marker",
            ));
        }
        Ok(())
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Read a value without loading. `None` for absent and negative entries.
    pub async fn get(&self, key: &str) -> CacheResult<Option<T>> {
        if !self.is_started() {
            return Ok(None);
        }
        validate_key(key)?;

        let obj = self.backend.get(key).await?;
        match obj.state() {
            CacheState::Absent => self.incr_miss(),
            CacheState::Negative => self.incr_negative_hit(),
            CacheState::Present => self.handle_hit(key).await?,
        }
        Ok(obj.into_data())
    }

    /// Read several values without loading. Absent and negative entries are
    /// left out of the result.
    pub async fn get_many<K: AsRef<str>>(&self, keys: &[K]) -> CacheResult<Vec<T>> {
        if !self.is_started() {
            return Ok(Vec::new());
        }
        let keys = owned_keys(keys)?;

        let objs = self.backend.get_many(&keys).await?;
        let mut values = Vec::with_capacity(objs.len());
        for obj in objs {
            match obj.state() {
                CacheState::Absent => self.incr_miss(),
                CacheState::Negative => self.incr_negative_hit(),
                CacheState::Present => {
                    self.incr_hit();
                    values.extend(obj.into_data());
                }
            }
        }
        Ok(values)
    }

    /// Read a value, loading it on a miss.
    ///
    /// The loader must not call back into this cache: the instance load
    /// lock is held while it runs. Loader errors are returned unchanged and
    /// nothing is cached for the key.
    pub async fn get_or_load<L>(&self, key: &str, loader: &L) -> CacheResult<Option<T>>
    where
        L: Loader<T> + ?Sized,
    {
        validate_key(key)?;
        if !self.is_started() {
            return loader.load(key).await;
        }

        let obj = self.backend.get(key).await?;
        match obj.state() {
            CacheState::Present => {
                self.handle_hit(key).await?;
                Ok(obj.into_data())
            }
            CacheState::Negative => {
                self.incr_negative_hit();
                Ok(None)
            }
            CacheState::Absent => {
                self.incr_miss();
                Ok(self.load_with_lock(key, loader).await?.into_data())
            }
        }
    }

    /// Read several values, loading misses one key at a time.
    ///
    /// While stopped, `batch_loader` (when given) fetches every key in one
    /// call; otherwise the result is empty.
    pub async fn get_or_load_many<K, L>(
        &self,
        keys: &[K],
        loader: &L,
        batch_loader: Option<&dyn BatchLoader<T>>,
    ) -> CacheResult<Vec<T>>
    where
        K: AsRef<str>,
        L: Loader<T> + ?Sized,
    {
        let keys = owned_keys(keys)?;
        if !self.is_started() {
            return match batch_loader {
                Some(batch) => batch.load_many(&keys).await,
                None => Ok(Vec::new()),
            };
        }

        let objs = self.backend.get_many(&keys).await?;
        let mut values = Vec::with_capacity(objs.len());
        for obj in objs {
            let obj = match obj.state() {
                CacheState::Absent => {
                    self.incr_miss();
                    self.load_with_lock(obj.key(), loader).await?
                }
                CacheState::Negative => {
                    self.incr_negative_hit();
                    obj
                }
                CacheState::Present => {
                    self.handle_hit(obj.key()).await?;
                    obj
                }
            };
            values.extend(obj.into_data());
        }
        Ok(values)
    }

    /// Stampede-protected load of a key that was just found absent.
    async fn load_with_lock<L>(&self, key: &str, loader: &L) -> CacheResult<CachedObject<T>>
    where
        L: Loader<T> + ?Sized,
    {
        let obj = {
            let _local = self.load_lock.lock().await;

            // Another task may have loaded the key while we waited.
            let obj = self.backend.get(key).await?;
            if !obj.is_absent() {
                obj
            } else {
                match &self.distributed_lock {
                    Some(provider) => self.load_under_distributed_lock(provider.as_ref(), key, loader).await?,
                    None => self.fetch_object(key, loader).await?,
                }
            }
        };

        match obj.state() {
            CacheState::Negative => self.incr_negative_hit(),
            CacheState::Present => self.handle_hit(key).await?,
            CacheState::Absent => {}
        }
        Ok(obj)
    }

    async fn load_under_distributed_lock<L>(
        &self,
        provider: &dyn DistributedLock,
        key: &str,
        loader: &L,
    ) -> CacheResult<CachedObject<T>>
    where
        L: Loader<T> + ?Sized,
    {
        let lock_name = lock_name_for(key);
        let guard = provider.acquire(&lock_name).await?;

        // Another process may have loaded the key while we waited.
        let loaded = match self.backend.get(key).await {
            Ok(obj) if obj.is_absent() => self.fetch_object(key, loader).await,
            other => other,
        };
        let released = guard.unlock().await;

        let obj = loaded?;
        released?;
        Ok(obj)
    }

    /// Call the loader and store its outcome.
    async fn fetch_object<L>(&self, key: &str, loader: &L) -> CacheResult<CachedObject<T>>
    where
        L: Loader<T> + ?Sized,
    {
        let (expiry_secs, prevent, negative_secs) = {
            let s = self.read_settings();
            (
                s.expiry_secs,
                s.breakdown_prevention_enabled,
                s.negative_cache_expiry_secs,
            )
        };

        debug!(cache = %self.name, key = %key, "Loading value on cache miss");
        // A value the backend would read back as its marker counts as not found.
        let loaded = loader
            .load(key)
            .await?
            .filter(|value| !self.backend.is_negative_marker(value));
        match loaded {
            Some(value) => {
                self.backend.put(key, value.clone(), expiry_secs).await?;
                Ok(CachedObject::present(key, value))
            }
            None if prevent => {
                self.backend
                    .put_negative(key, negative_secs.max(1))
                    .await?;
                debug!(cache = %self.name, key = %key, "Stored negative marker");
                Ok(CachedObject::negative(key))
            }
            None => Ok(CachedObject::absent(key)),
        }
    }

    // ========================================================================
    // REMOVAL
    // ========================================================================

    pub async fn remove(&self, key: &str) -> CacheResult<()> {
        if !self.is_started() {
            return Ok(());
        }
        validate_key(key)?;
        self.backend.remove(key).await
    }

    pub async fn remove_many<K: AsRef<str>>(&self, keys: &[K]) -> CacheResult<()> {
        if !self.is_started() {
            return Ok(());
        }
        let keys = owned_keys(keys)?;
        self.backend.remove_many(&keys).await
    }

    /// Remove every entry. Fails with `Unsupported` on backends that
    /// cannot clear.
    pub async fn clear(&self) -> CacheResult<()> {
        if !self.is_started() {
            return Ok(());
        }
        self.backend.clear().await
    }

    /// Evict `key`, run `updater`, then schedule a delayed second eviction.
    ///
    /// The updater runs exactly once, also on a stopped cache. A failed
    /// immediate eviction is returned before the updater runs.
    pub async fn delay_remove<R, F, Fut>(&self, key: &str, updater: F) -> CacheResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = R>,
    {
        validate_schedulable(key)?;
        let started = self.is_started();
        if started {
            self.backend.remove(key).await?;
        }

        let result = updater().await;

        if started {
            self.schedule_eviction(key)?;
        }
        Ok(result)
    }

    /// Schedule a delayed eviction without an immediate one.
    pub fn schedule_eviction(&self, key: &str) -> CacheResult<()> {
        validate_schedulable(key)?;
        if !self.is_started() || self.read_settings().delay_eviction_millis == 0 {
            return Ok(());
        }
        self.eviction.schedule_eviction(key)
    }

    pub fn schedule_evictions<K: AsRef<str>>(&self, keys: &[K]) -> CacheResult<()> {
        for key in keys {
            self.schedule_eviction(key.as_ref())?;
        }
        Ok(())
    }

    /// Delayed evictions waiting to run.
    pub fn pending_evictions(&self) -> usize {
        self.eviction.pending()
    }

    // ========================================================================
    // INTROSPECTION
    // ========================================================================

    pub async fn size(&self) -> CacheResult<usize> {
        if !self.is_started() {
            return Ok(0);
        }
        self.backend.size().await
    }

    /// Remaining lifetime as reported by the backend, sentinels included.
    pub async fn ttl(&self, key: &str) -> CacheResult<i64> {
        validate_key(key)?;
        self.backend.ttl(key).await
    }

    pub fn hits(&self) -> u64 {
        self.stats.hits()
    }

    pub fn negative_hits(&self) -> u64 {
        self.stats.negative_hits()
    }

    pub fn misses(&self) -> u64 {
        self.stats.misses()
    }

    pub fn stats_snapshot(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    // ========================================================================
    // STATISTICS
    // ========================================================================

    fn stats_enabled(&self) -> bool {
        self.read_settings().stats_enabled
    }

    fn incr_hit(&self) {
        if self.stats_enabled() {
            self.stats.record_hit();
        }
    }

    fn incr_negative_hit(&self) {
        if self.stats_enabled() {
            self.stats.record_negative_hit();
        }
    }

    fn incr_miss(&self) {
        if self.stats_enabled() {
            self.stats.record_miss();
        }
    }

    /// Count a hit and slide the entry's expiry forward.
    async fn handle_hit(&self, key: &str) -> CacheResult<()> {
        self.incr_hit();
        let expiry_secs = self.read_settings().expiry_secs;
        if expiry_secs > 0 {
            self.backend.extend_expiry(key, expiry_secs).await?;
        }
        Ok(())
    }
}

/// Keys accepted by the delayed eviction queue.
fn validate_schedulable(key: &str) -> CacheResult<()> {
    validate_key(key)?;
    if key == STOP_COMMAND {
        return Err(CacheError::invalid_argument(
            "key",
            format!("{} is a reserved key", STOP_COMMAND),
        ));
    }
    Ok(())
}

fn owned_keys<K: AsRef<str>>(keys: &[K]) -> CacheResult<Vec<String>> {
    if keys.is_empty() {
        return Err(CacheError::invalid_argument("keys", "the keys are empty"));
    }
    keys.iter()
        .map(|k| {
            let k = k.as_ref();
            validate_key(k).map(|_| k.to_string())
        })
        .collect()
}

impl<T, B> PartialEq for Cache<T, B>
where
    T: Clone + Send + Sync + 'static,
    B: CacheBackend<T> + 'static,
{
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<T, B> Eq for Cache<T, B>
where
    T: Clone + Send + Sync + 'static,
    B: CacheBackend<T> + 'static,
{
}

impl<T, B> Hash for Cache<T, B>
where
    T: Clone + Send + Sync + 'static,
    B: CacheBackend<T> + 'static,
{
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl<T, B> std::fmt::Debug for Cache<T, B>
where
    T: Clone + Send + Sync + 'static,
    B: CacheBackend<T> + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("started", &self.is_started())
            .finish()
    }
}
