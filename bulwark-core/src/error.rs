//! Error types for bulwark cache operations

use thiserror::Error;

/// Master error type for all cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Invalid argument {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    #[error("Backend {backend} failed: {reason}")]
    Backend { backend: String, reason: String },

    #[error("Operation {operation} is not supported by the {backend} backend")]
    Unsupported { operation: String, backend: String },

    #[error("Lock {lock_name} failed: {reason}")]
    Lock { lock_name: String, reason: String },

    #[error("Illegal state: {reason}")]
    IllegalState { reason: String },

    #[error("Loader failed for key {key}: {reason}")]
    Loader { key: String, reason: String },
}

impl CacheError {
    /// Shorthand for an `InvalidArgument` error.
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheError::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a `Backend` error.
    pub fn backend(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheError::Backend {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an `Unsupported` error.
    pub fn unsupported(operation: impl Into<String>, backend: impl Into<String>) -> Self {
        CacheError::Unsupported {
            operation: operation.into(),
            backend: backend.into(),
        }
    }

    /// Shorthand for a `Lock` error.
    pub fn lock(lock_name: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheError::Lock {
            lock_name: lock_name.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an `IllegalState` error.
    pub fn illegal_state(reason: impl Into<String>) -> Self {
        CacheError::IllegalState {
            reason: reason.into(),
        }
    }

    /// Whether the error came from the storage backend.
    pub fn is_backend(&self) -> bool {
        matches!(self, CacheError::Backend { .. })
    }
}

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
