//! Process-local backend on a concurrent map.
//!
//! Entries carry an optional deadline measured with `tokio::time::Instant`,
//! so a paused test clock drives expiry. Expired entries are dropped lazily
//! on access, or eagerly through [`InMemoryBackend::purge_expired`].

use async_trait::async_trait;
use bulwark_core::{CacheResult, CachedObject, KeyBuilder};
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::backend::CacheBackend;

#[derive(Debug, Clone)]
enum Stored<T> {
    Value(T),
    Negative,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    stored: Stored<T>,
    expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    fn new(stored: Stored<T>, ttl_secs: u64) -> Self {
        Self {
            stored,
            expires_at: deadline(ttl_secs),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// `None` for 0 and for lifetimes past the clock's range: both never expire.
fn deadline(ttl_secs: u64) -> Option<Instant> {
    if ttl_secs == 0 {
        None
    } else {
        Instant::now().checked_add(Duration::from_secs(ttl_secs))
    }
}

/// In-process cache backend.
///
/// # Example
///
/// ```ignore
/// let backend = Arc::new(InMemoryBackend::<Order>::with_namespace("shop"));
/// let cache = Cache::new(CacheSettings::new("orders"), backend)?;
/// ```
#[derive(Debug)]
pub struct InMemoryBackend<T> {
    entries: DashMap<String, Entry<T>>,
    namespace: Option<String>,
}

impl<T> Default for InMemoryBackend<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InMemoryBackend<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            namespace: None,
        }
    }

    /// Prefix every stored key with `namespace:`.
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            entries: DashMap::new(),
            namespace: Some(namespace.into()),
        }
    }

    fn storage_key(&self, key: &str) -> String {
        match &self.namespace {
            Some(ns) => KeyBuilder::new().append(ns).append(key).into_string(),
            None => key.to_string(),
        }
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Stored keys including the namespace prefix.
    pub fn raw_keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

impl<T: Clone> InMemoryBackend<T> {
    fn lookup(&self, key: &str) -> CachedObject<T> {
        let storage_key = self.storage_key(key);
        let now = Instant::now();

        let found = match self.entries.get(&storage_key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.stored.clone()),
            Some(_) => None,
            None => return CachedObject::absent(key),
        };

        match found {
            Some(Stored::Value(v)) => CachedObject::present(key, v),
            Some(Stored::Negative) => CachedObject::negative(key),
            None => {
                // The read guard is released above; dropping here cannot deadlock.
                self.entries
                    .remove_if(&storage_key, |_, entry| entry.is_expired(now));
                CachedObject::absent(key)
            }
        }
    }
}

#[async_trait]
impl<T> CacheBackend<T> for InMemoryBackend<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, value: T, ttl_secs: u64) -> CacheResult<()> {
        self.entries.insert(
            self.storage_key(key),
            Entry::new(Stored::Value(value), ttl_secs),
        );
        Ok(())
    }

    async fn put_negative(&self, key: &str, ttl_secs: u64) -> CacheResult<()> {
        self.entries
            .insert(self.storage_key(key), Entry::new(Stored::Negative, ttl_secs));
        Ok(())
    }

    async fn get(&self, key: &str) -> CacheResult<CachedObject<T>> {
        Ok(self.lookup(key))
    }

    async fn get_many(&self, keys: &[String]) -> CacheResult<Vec<CachedObject<T>>> {
        Ok(keys.iter().map(|k| self.lookup(k)).collect())
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        self.entries.remove(&self.storage_key(key));
        Ok(())
    }

    async fn remove_many(&self, keys: &[String]) -> CacheResult<()> {
        for key in keys {
            self.entries.remove(&self.storage_key(key));
        }
        Ok(())
    }

    async fn clear(&self) -> CacheResult<()> {
        self.entries.clear();
        Ok(())
    }

    async fn size(&self) -> CacheResult<usize> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .count())
    }

    async fn extend_expiry(&self, key: &str, ttl_secs: u64) -> CacheResult<()> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(&self.storage_key(key)) {
            if !entry.is_expired(now) {
                entry.expires_at = deadline(ttl_secs);
            }
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> CacheResult<i64> {
        let now = Instant::now();
        let ttl = match self.entries.get(&self.storage_key(key)) {
            None => -2,
            Some(entry) if entry.is_expired(now) => -2,
            Some(entry) => match entry.expires_at {
                None => -1,
                Some(at) => {
                    let millis = at.saturating_duration_since(now).as_millis();
                    // Round up so a fresh 60s entry reports 60.
                    i64::try_from(millis.div_ceil(1000)).unwrap_or(i64::MAX)
                }
            },
        };
        Ok(ttl)
    }
}
