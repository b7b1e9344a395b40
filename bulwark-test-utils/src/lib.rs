//! bulwark Test Utilities
//!
//! Shared test infrastructure for the bulwark workspace:
//! - Counting and failing loaders
//! - A string-encoding backend with injectable failures
//! - An in-process named lock provider
//! - Proptest generators, fixtures and assertions

pub use bulwark_cache::{
    BatchLoader, Cache, CacheBackend, CacheRegistry, CacheStatsSnapshot, DistributedLock,
    InMemoryBackend, LifecycleListener, Loader, LockGuard, ManagedCache, NEGATIVE_MARKER,
};
pub use bulwark_core::{
    CacheError, CacheResult, CacheSettings, CacheState, CachedObject, KeyBuilder, RegistryPolicy,
};

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// LOADERS
// ============================================================================

/// Loader backed by a map, counting every call.
///
/// An optional delay widens the window in which concurrent callers can
/// pile up behind one load.
#[derive(Debug)]
pub struct CountingLoader<T> {
    source: DashMap<String, T>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl<T: Clone> Default for CountingLoader<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> CountingLoader<T> {
    pub fn new() -> Self {
        Self {
            source: DashMap::new(),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Sleep this long inside every load.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_value(self, key: impl Into<String>, value: T) -> Self {
        self.source.insert(key.into(), value);
        self
    }

    /// Change the source of truth.
    pub fn set(&self, key: impl Into<String>, value: T) {
        self.source.insert(key.into(), value);
    }

    pub fn unset(&self, key: &str) {
        self.source.remove(key);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T> Loader<T> for CountingLoader<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn load(&self, key: &str) -> CacheResult<Option<T>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.source.get(key).map(|v| v.value().clone()))
    }
}

#[async_trait]
impl<T> BatchLoader<T> for CountingLoader<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn load_many(&self, keys: &[String]) -> CacheResult<Vec<T>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(keys
            .iter()
            .filter_map(|k| self.source.get(k).map(|v| v.value().clone()))
            .collect())
    }
}

/// Loader whose source is down.
#[derive(Debug, Default)]
pub struct FailingLoader {
    calls: AtomicUsize,
}

impl FailingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Send + 'static> Loader<T> for FailingLoader {
    async fn load(&self, key: &str) -> CacheResult<Option<T>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Loader {
            key: key.to_string(),
            reason: "source unavailable".to_string(),
        })
    }
}

// ============================================================================
// BACKENDS
// ============================================================================

/// Backend that stores values as strings and marks absences with
/// [`NEGATIVE_MARKER`], the way remote key-value stores do.
///
/// Reads, writes and removals can be made to fail. Clearing is not
/// supported.
#[derive(Debug, Default)]
pub struct StringBackend {
    inner: InMemoryBackend<String>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_removes: AtomicBool,
    write_budget: Mutex<Option<usize>>,
    removals: AtomicUsize,
}

impl StringBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Let `writes` more puts succeed, then fail every later one.
    pub fn fail_writes_after(&self, writes: usize) {
        *self.write_budget.lock().unwrap_or_else(|e| e.into_inner()) = Some(writes);
    }

    pub fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    /// Successful single-key removals so far.
    pub fn removals(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }

    /// The raw stored string, marker included.
    pub async fn raw(&self, key: &str) -> Option<String> {
        self.inner.get(key).await.ok().and_then(|obj| obj.into_data())
    }

    fn check(&self, flag: &AtomicBool, operation: &str) -> CacheResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(CacheError::backend(
                "string",
                format!("{} failed", operation),
            ));
        }
        Ok(())
    }

    fn spend_write(&self) -> CacheResult<()> {
        self.check(&self.fail_writes, "put")?;
        let mut budget = self.write_budget.lock().unwrap_or_else(|e| e.into_inner());
        match budget.as_mut() {
            Some(0) => Err(CacheError::backend("string", "write budget exhausted")),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CacheBackend<String> for StringBackend {
    fn kind(&self) -> &'static str {
        "string"
    }

    async fn put(&self, key: &str, value: String, ttl_secs: u64) -> CacheResult<()> {
        self.spend_write()?;
        self.inner.put(key, value, ttl_secs).await
    }

    async fn put_negative(&self, key: &str, ttl_secs: u64) -> CacheResult<()> {
        self.check(&self.fail_writes, "put_negative")?;
        self.inner
            .put(key, NEGATIVE_MARKER.to_string(), ttl_secs)
            .await
    }

    async fn get(&self, key: &str) -> CacheResult<CachedObject<String>> {
        self.check(&self.fail_reads, "get")?;
        let raw = self.inner.get(key).await?.into_data();
        Ok(CachedObject::from_raw(
            key,
            raw,
            |v: &String| v == NEGATIVE_MARKER,
            |v| v,
        ))
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        self.check(&self.fail_removes, "remove")?;
        self.inner.remove(key).await?;
        self.removals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn size(&self) -> CacheResult<usize> {
        self.inner.size().await
    }

    async fn extend_expiry(&self, key: &str, ttl_secs: u64) -> CacheResult<()> {
        self.inner.extend_expiry(key, ttl_secs).await
    }

    async fn ttl(&self, key: &str) -> CacheResult<i64> {
        self.inner.ttl(key).await
    }

    fn is_negative_marker(&self, value: &String) -> bool {
        value == NEGATIVE_MARKER
    }
}

// ============================================================================
// LOCKS
// ============================================================================

/// Named locks shared by every cache holding the same provider, standing in
/// for a lock service shared across processes.
#[derive(Debug, Default)]
pub struct LocalLockProvider {
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    acquired: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
    names: Mutex<Vec<String>>,
    fail_unlock: bool,
}

impl LocalLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `unlock` releases the lock and then reports an error.
    pub fn with_failing_unlock() -> Self {
        Self {
            fail_unlock: true,
            ..Self::default()
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Lock names in acquisition order.
    pub fn names(&self) -> Vec<String> {
        self.names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

struct LocalLockGuard {
    name: String,
    guard: tokio::sync::OwnedMutexGuard<()>,
    released: Arc<AtomicUsize>,
    fail_unlock: bool,
}

#[async_trait]
impl LockGuard for LocalLockGuard {
    async fn unlock(self: Box<Self>) -> CacheResult<()> {
        let LocalLockGuard {
            name,
            guard,
            released,
            fail_unlock,
        } = *self;
        drop(guard);
        released.fetch_add(1, Ordering::SeqCst);
        if fail_unlock {
            return Err(CacheError::lock(name, "lease already expired"));
        }
        Ok(())
    }
}

#[async_trait]
impl DistributedLock for LocalLockProvider {
    async fn acquire(&self, lock_name: &str) -> CacheResult<Box<dyn LockGuard>> {
        let mutex = self
            .locks
            .entry(lock_name.to_string())
            .or_default()
            .value()
            .clone();
        let guard = mutex.lock_owned().await;

        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(lock_name.to_string());
        Ok(Box::new(LocalLockGuard {
            name: lock_name.to_string(),
            guard,
            released: Arc::clone(&self.released),
            fail_unlock: self.fail_unlock,
        }))
    }
}

/// Lock service that cannot be reached.
#[derive(Debug, Default)]
pub struct UnavailableLockProvider;

#[async_trait]
impl DistributedLock for UnavailableLockProvider {
    async fn acquire(&self, lock_name: &str) -> CacheResult<Box<dyn LockGuard>> {
        Err(CacheError::lock(lock_name, "lock service unavailable"))
    }
}

// ============================================================================
// LISTENERS
// ============================================================================

/// Lifecycle listener recording `started:<name>` / `stopping:<name>`.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records events, then reports an error for each.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn record(&self, event: &str, cache: &str) -> CacheResult<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(format!("{}:{}", event, cache));
        if self.fail {
            return Err(CacheError::illegal_state(format!("listener rejected {}", event)));
        }
        Ok(())
    }
}

impl LifecycleListener for RecordingListener {
    fn started(&self, cache: &str) -> CacheResult<()> {
        self.record("started", cache)
    }

    fn stopping(&self, cache: &str) -> CacheResult<()> {
        self.record("stopping", cache)
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys, settings and policies.

    use super::*;
    use proptest::prelude::*;

    /// Generate a valid cache key such as `order:42`.
    pub fn arb_key() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_-]{0,11}(:[a-z0-9_-]{1,8}){0,3}"
    }

    /// Generate a non-empty list of distinct keys.
    pub fn arb_keys(max: usize) -> impl Strategy<Value = Vec<String>> {
        proptest::collection::hash_set(arb_key(), 1..=max.max(1))
            .prop_map(|keys| keys.into_iter().collect())
    }

    /// Generate a key that must be rejected.
    pub fn arb_blank_key() -> impl Strategy<Value = String> {
        "[ \t\n]{0,4}"
    }

    /// Generate valid settings with delayed eviction disabled.
    pub fn arb_settings() -> impl Strategy<Value = CacheSettings> {
        (
            arb_key(),
            0u64..3600,
            any::<bool>(),
            any::<bool>(),
            1u64..600,
        )
            .prop_map(|(name, expiry, stats, prevent, negative)| {
                CacheSettings::new(name)
                    .with_expiry_secs(expiry)
                    .with_stats(stats)
                    .with_breakdown_prevention(prevent)
                    .with_negative_expiry_secs(negative)
                    .with_delay_eviction_millis(0)
            })
    }

    /// Generate a valid registry policy.
    pub fn arb_policy() -> impl Strategy<Value = RegistryPolicy> {
        (any::<bool>(), any::<bool>(), 1u64..600).prop_map(|(stats, prevent, negative)| {
            RegistryPolicy {
                stats_enabled: stats,
                breakdown_prevention_enabled: prevent,
                negative_cache_expiry_secs: negative,
            }
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built settings and caches for common scenarios.

    use super::*;

    pub type MemoryCache = Cache<String, InMemoryBackend<String>>;

    /// Key for order `id`: `order:<id>`.
    pub fn order_key(id: u64) -> String {
        KeyBuilder::new()
            .append("order")
            .append(&id.to_string())
            .into_string()
    }

    /// 60s expiry, statistics on, 5s negative markers, 1s eviction delay.
    pub fn orders_settings() -> CacheSettings {
        CacheSettings::new("orders")
            .with_description("orders by id")
            .with_expiry_secs(60)
            .with_stats(true)
            .with_breakdown_prevention(true)
            .with_negative_expiry_secs(5)
            .with_delay_eviction_millis(1000)
    }

    /// A started in-memory cache.
    pub fn started_memory_cache(settings: CacheSettings) -> Arc<MemoryCache> {
        let cache = Cache::new(settings, Arc::new(InMemoryBackend::new()))
            .expect("fixture settings are valid");
        cache.start().expect("cache starts inside a runtime");
        Arc::new(cache)
    }

    /// A started cache over a [`StringBackend`], returning both.
    pub fn started_string_cache(
        settings: CacheSettings,
    ) -> (Arc<Cache<String, StringBackend>>, Arc<StringBackend>) {
        let backend = Arc::new(StringBackend::new());
        let cache = Cache::new(settings, Arc::clone(&backend)).expect("fixture settings are valid");
        cache.start().expect("cache starts inside a runtime");
        (Arc::new(cache), backend)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on error kinds and statistics.

    use super::*;

    /// Assert that a result is an InvalidArgument error.
    pub fn assert_invalid_argument<T: std::fmt::Debug>(result: &CacheResult<T>) {
        assert!(
            matches!(result, Err(CacheError::InvalidArgument { .. })),
            "Expected InvalidArgument, got: {:?}",
            result
        );
    }

    /// Assert that a result is a Backend error.
    pub fn assert_backend_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        assert!(
            matches!(result, Err(CacheError::Backend { .. })),
            "Expected Backend error, got: {:?}",
            result
        );
    }

    /// Assert that a result is a Lock error.
    pub fn assert_lock_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        assert!(
            matches!(result, Err(CacheError::Lock { .. })),
            "Expected Lock error, got: {:?}",
            result
        );
    }

    /// Assert that a result is an Unsupported error.
    pub fn assert_unsupported<T: std::fmt::Debug>(result: &CacheResult<T>) {
        assert!(
            matches!(result, Err(CacheError::Unsupported { .. })),
            "Expected Unsupported, got: {:?}",
            result
        );
    }

    /// Assert exact hit / negative-hit / miss counters.
    pub fn assert_stats(snapshot: CacheStatsSnapshot, hits: u64, negative_hits: u64, misses: u64) {
        assert_eq!(
            snapshot,
            CacheStatsSnapshot {
                hits,
                negative_hits,
                misses,
            },
            "Unexpected cache statistics"
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================
