//! Lifecycle listeners notified when a cache starts or is about to stop.

use std::sync::Arc;

use bulwark_core::CacheResult;
use tracing::warn;

/// Observer of a cache instance's lifecycle. Errors are logged, never
/// propagated, so one listener cannot block start or stop.
pub trait LifecycleListener: Send + Sync {
    fn started(&self, _cache: &str) -> CacheResult<()> {
        Ok(())
    }

    fn stopping(&self, _cache: &str) -> CacheResult<()> {
        Ok(())
    }
}

pub(crate) fn notify_started(listeners: &[Arc<dyn LifecycleListener>], cache: &str) {
    for listener in listeners {
        if let Err(e) = listener.started(cache) {
            warn!(cache = %cache, error = %e, "Lifecycle listener failed on start");
        }
    }
}

pub(crate) fn notify_stopping(listeners: &[Arc<dyn LifecycleListener>], cache: &str) {
    for listener in listeners {
        if let Err(e) = listener.stopping(cache) {
            warn!(cache = %cache, error = %e, "Lifecycle listener failed on stop");
        }
    }
}
