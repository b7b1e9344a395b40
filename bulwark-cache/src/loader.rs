//! Loader traits for fetching values from the source of truth on a miss.
//!
//! Both traits have blanket implementations for closures taking an owned key
//! and returning an owned (`'static`) future, so most callers never name
//! them. Loaders that borrow state implement the traits on a struct.
//!
//! ```ignore
//! let loader = move |key: String| {
//!     let db = db.clone();
//!     async move { db.find_order(&key).await }
//! };
//! let order = cache.get_or_load("order:1", &loader).await?;
//! ```

use std::future::Future;

use async_trait::async_trait;
use bulwark_core::CacheResult;

/// Fetches a single value; `Ok(None)` means the source has no value.
#[async_trait]
pub trait Loader<T>: Send + Sync {
    async fn load(&self, key: &str) -> CacheResult<Option<T>>;
}

#[async_trait]
impl<T, F, Fut> Loader<T> for F
where
    T: Send + 'static,
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = CacheResult<Option<T>>> + Send + 'static,
{
    async fn load(&self, key: &str) -> CacheResult<Option<T>> {
        (self)(key.to_string()).await
    }
}

/// Fetches several values in one round trip.
///
/// Only consulted while a cache is stopped; a started cache loads missing
/// keys one at a time under its load lock.
#[async_trait]
pub trait BatchLoader<T>: Send + Sync {
    async fn load_many(&self, keys: &[String]) -> CacheResult<Vec<T>>;
}

#[async_trait]
impl<T, F, Fut> BatchLoader<T> for F
where
    T: Send + 'static,
    F: Fn(Vec<String>) -> Fut + Send + Sync,
    Fut: Future<Output = CacheResult<Vec<T>>> + Send + 'static,
{
    async fn load_many(&self, keys: &[String]) -> CacheResult<Vec<T>> {
        (self)(keys.to_vec()).await
    }
}
