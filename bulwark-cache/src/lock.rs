//! Distributed lock collaborator.
//!
//! The cache core does not implement a lock algorithm. When a provider is
//! configured, the load path takes a named lock around the final re-check
//! and the loader call so that several processes sharing one backend still
//! load a key only once.

use async_trait::async_trait;
use bulwark_core::{CacheResult, KeyBuilder};
use sha2::{Digest, Sha256};

/// A held lock. Dropping a guard without calling `unlock` leaves release to
/// the provider (typically a lease timeout).
#[async_trait]
pub trait LockGuard: Send {
    async fn unlock(self: Box<Self>) -> CacheResult<()>;
}

/// Provider of named locks shared across processes.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Block until the named lock is held.
    async fn acquire(&self, lock_name: &str) -> CacheResult<Box<dyn LockGuard>>;
}

/// Lock name for a cache key: `dislock:key:<sha256 hex>`.
pub fn lock_name_for(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    KeyBuilder::new()
        .build(["dislock", "key"])
        .append(&hex::encode(digest))
        .into_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_name_is_stable() {
        assert_eq!(lock_name_for("order:1"), lock_name_for("order:1"));
        assert_ne!(lock_name_for("order:1"), lock_name_for("order:2"));
    }

    #[test]
    fn test_lock_name_shape() {
        let name = lock_name_for("order:1");
        assert!(name.starts_with("dislock:key:"));
        // sha256 hex digest
        assert_eq!(name.len(), "dislock:key:".len() + 64);
    }
}
