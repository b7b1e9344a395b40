//! bulwark core - value types, errors and configuration
//!
//! Dependency-light leaf crate shared by the cache core and by backend
//! adapters. Nothing in here performs I/O.

pub mod cached;
pub mod config;
pub mod error;
pub mod key;

pub use cached::{validate_key, CacheState, CachedObject};
pub use config::{
    CacheSettings, RegistryConfig, RegistryPolicy, DEFAULT_DELAY_EVICTION_MILLIS,
    DEFAULT_NEGATIVE_CACHE_EXPIRY_SECS,
};
pub use error::{CacheError, CacheResult};
pub use key::{KeyBuilder, KEY_SEPARATOR};
