//! Cache backend trait.
//!
//! This module defines the storage primitives a backend must provide to sit
//! underneath [`Cache`](crate::Cache). The cache core never assumes the
//! backend is process-local: an implementation may be a concurrent map, a
//! remote key-value store, or anything in between.

use async_trait::async_trait;
use bulwark_core::{CacheError, CacheResult, CachedObject};

/// Raw value string-encoding backends store to mark a confirmed absence.
pub const NEGATIVE_MARKER: &str = ".";

/// Cache backend trait for pluggable storage implementations.
///
/// # TTL
///
/// Every `ttl_secs` argument uses 0 for "never expires".
///
/// # Batches
///
/// The batched forms default to looping over the single-key forms. A backend
/// with a native batch round trip should override them. Batched writes are
/// not atomic: a failure part-way may leave a subset written.
///
/// # Visibility
///
/// A write through one backend instance must be visible to the next read of
/// the same key through that instance.
#[async_trait]
pub trait CacheBackend<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Short backend identifier, e.g. `"memory"` or `"redis"`.
    fn kind(&self) -> &'static str;

    /// Store a value.
    async fn put(&self, key: &str, value: T, ttl_secs: u64) -> CacheResult<()>;

    /// Store several values.
    async fn put_many(&self, values: Vec<(String, T)>, ttl_secs: u64) -> CacheResult<()> {
        for (key, value) in values {
            self.put(&key, value, ttl_secs).await?;
        }
        Ok(())
    }

    /// Store a negative marker.
    async fn put_negative(&self, key: &str, ttl_secs: u64) -> CacheResult<()>;

    /// Look up one key.
    async fn get(&self, key: &str) -> CacheResult<CachedObject<T>>;

    /// Look up several keys, one result per key in input order.
    async fn get_many(&self, keys: &[String]) -> CacheResult<Vec<CachedObject<T>>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get(key).await?);
        }
        Ok(results)
    }

    /// Remove one key. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> CacheResult<()>;

    /// Remove several keys.
    async fn remove_many(&self, keys: &[String]) -> CacheResult<()> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }

    /// Remove every entry.
    async fn clear(&self) -> CacheResult<()> {
        Err(CacheError::unsupported("clear", self.kind()))
    }

    /// Number of live entries.
    async fn size(&self) -> CacheResult<usize>;

    /// Reset the lifetime of an existing entry.
    async fn extend_expiry(&self, key: &str, ttl_secs: u64) -> CacheResult<()>;

    /// Remaining lifetime in seconds. Backend-defined sentinels (such as -1
    /// for "no expiry" and -2 for "missing") are passed through unchanged.
    async fn ttl(&self, key: &str) -> CacheResult<i64>;

    /// Whether a value collides with the backend's negative marker encoding.
    fn is_negative_marker(&self, _value: &T) -> bool {
        false
    }
}
