//! Read-through, negative caching and delayed eviction tests
//!
//! Time-dependent behaviour runs on a paused tokio clock: negative markers
//! and delayed evictions are driven with `tokio::time::advance` / `sleep`.

use bulwark_cache::{
    CacheBackend, LifecycleListener, TokioWorkerPool, WorkerPool, NEGATIVE_MARKER,
};
use bulwark_test_utils::assertions::{
    assert_backend_error, assert_invalid_argument, assert_stats, assert_unsupported,
};
use bulwark_test_utils::fixtures::{self, order_key, orders_settings};
use bulwark_test_utils::{Cache, CountingLoader, RecordingListener, StringBackend};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Route library logs to the test harness; `RUST_LOG=bulwark_cache=debug`
/// shows eviction dispatch.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test(start_paused = true)]
async fn test_orders_negative_marker_expires() {
    let cache = fixtures::started_memory_cache(orders_settings());
    let loader: CountingLoader<String> = CountingLoader::new();
    let key = order_key(1);

    assert_eq!(cache.get_or_load(&key, &loader).await.unwrap(), None);
    assert_eq!(loader.calls(), 1);

    assert_eq!(cache.get_or_load(&key, &loader).await.unwrap(), None);
    assert_eq!(loader.calls(), 1);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(cache.get_or_load(&key, &loader).await.unwrap(), None);
    assert_eq!(loader.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_negative_marker_replaced_once_source_has_value() {
    let cache = fixtures::started_memory_cache(orders_settings());
    let loader: CountingLoader<String> = CountingLoader::new();
    let key = order_key(2);

    assert_eq!(cache.get_or_load(&key, &loader).await.unwrap(), None);
    loader.set(key.clone(), "created".to_string());

    // still answered by the marker
    assert_eq!(cache.get_or_load(&key, &loader).await.unwrap(), None);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(
        cache.get_or_load(&key, &loader).await.unwrap(),
        Some("created".to_string())
    );
    assert_eq!(loader.calls(), 2);
}

#[tokio::test]
async fn test_string_backend_stores_marker() {
    let (cache, backend) = fixtures::started_string_cache(orders_settings());
    let loader: CountingLoader<String> = CountingLoader::new();

    assert_eq!(cache.get_or_load("order:9", &loader).await.unwrap(), None);
    assert_eq!(backend.raw("order:9").await, Some(NEGATIVE_MARKER.to_string()));
    assert_eq!(cache.ttl("order:9").await.unwrap(), 5);
    assert!(cache.get("order:9").await.unwrap().is_none());
    assert_stats(cache.stats_snapshot(), 0, 2, 1);
}

#[tokio::test]
async fn test_string_backend_rejects_marker_value() {
    let (cache, _backend) = fixtures::started_string_cache(orders_settings());
    assert_invalid_argument(&cache.put("order:1", NEGATIVE_MARKER.to_string()).await);
    assert_invalid_argument(
        &cache
            .put_many(vec![
                ("order:1".to_string(), "ok".to_string()),
                ("order:2".to_string(), NEGATIVE_MARKER.to_string()),
            ])
            .await,
    );
    assert_eq!(cache.size().await.unwrap(), 0);
    assert_unsupported(&cache.clear().await);
}

#[tokio::test]
async fn test_backend_errors_propagate() {
    let (cache, backend) = fixtures::started_string_cache(orders_settings());
    let loader = CountingLoader::new().with_value("order:1", "v".to_string());

    backend.fail_reads(true);
    assert_backend_error(&cache.get("order:1").await);
    assert_backend_error(&cache.get_or_load("order:1", &loader).await);
    assert_eq!(loader.calls(), 0);

    backend.fail_reads(false);
    backend.fail_writes(true);
    assert_backend_error(&cache.get_or_load("order:1", &loader).await);
    assert_eq!(loader.calls(), 1);
    assert_eq!(cache.size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_round_trip_and_remove() {
    let cache = fixtures::started_memory_cache(orders_settings());

    cache.put("order:1", "a".to_string()).await.unwrap();
    cache
        .put_many(vec![
            ("order:2".to_string(), "b".to_string()),
            ("order:3".to_string(), "c".to_string()),
        ])
        .await
        .unwrap();
    assert_eq!(cache.get("order:1").await.unwrap(), Some("a".to_string()));
    assert_eq!(
        cache.get_many(&["order:2", "order:3"]).await.unwrap(),
        vec!["b".to_string(), "c".to_string()]
    );
    assert_eq!(cache.ttl("order:1").await.unwrap(), 60);

    cache.remove("order:1").await.unwrap();
    cache.remove_many(&["order:2"]).await.unwrap();
    assert_eq!(cache.get("order:1").await.unwrap(), None);
    assert_eq!(cache.get("order:2").await.unwrap(), None);
    assert_eq!(cache.size().await.unwrap(), 1);

    cache.clear().await.unwrap();
    assert_eq!(cache.size().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delay_remove_evicts_stale_value() {
    init_tracing();
    let cache = fixtures::started_memory_cache(orders_settings());
    let key = order_key(1);
    cache.put(&key, "old".to_string()).await.unwrap();

    let updates = AtomicUsize::new(0);
    let counter = &updates;
    let stale_writer = Arc::clone(&cache);
    let stale_key = key.clone();
    let written = cache
        .delay_remove(&key, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            // a concurrent reader repopulates from a lagging replica
            stale_writer
                .backend()
                .put(&stale_key, "old".to_string(), 60)
                .await
                .unwrap();
            "new"
        })
        .await
        .unwrap();

    assert_eq!(written, "new");
    assert_eq!(updates.load(Ordering::SeqCst), 1);
    assert_eq!(cache.pending_evictions(), 1);
    assert_eq!(cache.get(&key).await.unwrap(), Some("old".to_string()));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(cache.get(&key).await.unwrap(), None);
    assert_eq!(cache.pending_evictions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delay_remove_stops_on_failed_immediate_eviction() {
    init_tracing();
    let (cache, backend) = fixtures::started_string_cache(orders_settings());
    cache.put("order:1", "old".to_string()).await.unwrap();

    backend.fail_removes(true);
    let updates = AtomicUsize::new(0);
    let counter = &updates;
    let result = cache
        .delay_remove("order:1", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;
    assert_backend_error(&result);
    assert_eq!(updates.load(Ordering::SeqCst), 0);
    assert_eq!(cache.pending_evictions(), 0);

    backend.fail_removes(false);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(cache.get("order:1").await.unwrap(), Some("old".to_string()));
    assert_eq!(backend.removals(), 0);
}

#[tokio::test]
async fn test_put_many_failure_leaves_prefix_written() {
    let (cache, backend) = fixtures::started_string_cache(orders_settings());
    backend.fail_writes_after(2);

    let result = cache
        .put_many(vec![
            ("order:1".to_string(), "a".to_string()),
            ("order:2".to_string(), "b".to_string()),
            ("order:3".to_string(), "c".to_string()),
        ])
        .await;
    assert_backend_error(&result);
    assert_eq!(backend.raw("order:1").await, Some("a".to_string()));
    assert_eq!(backend.raw("order:2").await, Some("b".to_string()));
    assert_eq!(backend.raw("order:3").await, None);
    assert_eq!(cache.size().await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_schedule_evictions_through_worker_pool() {
    let pool: Arc<dyn WorkerPool> = Arc::new(TokioWorkerPool::new(2).unwrap());
    let cache: Cache<String, StringBackend> =
        Cache::new(orders_settings(), Arc::new(StringBackend::new()))
            .unwrap()
            .with_worker_pool(pool);
    cache.start().unwrap();

    cache.put("order:1", "a".to_string()).await.unwrap();
    cache.put("order:2", "b".to_string()).await.unwrap();
    cache.schedule_evictions(&["order:1", "order:2"]).unwrap();
    assert_eq!(cache.pending_evictions(), 2);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(cache.size().await.unwrap(), 0);
    assert_eq!(cache.backend().removals(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_drops_pending_evictions() {
    let (cache, backend) = fixtures::started_string_cache(orders_settings());
    cache.put("order:1", "a".to_string()).await.unwrap();
    cache.schedule_eviction("order:1").unwrap();

    cache.stop();
    assert_eq!(cache.pending_evictions(), 0);
    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(backend.removals(), 0);
    assert_eq!(backend.raw("order:1").await, Some("a".to_string()));
}

#[tokio::test]
async fn test_statistics_on_and_off() {
    for enabled in [true, false] {
        let cache = fixtures::started_memory_cache(orders_settings().with_stats(enabled));
        let loader = CountingLoader::new().with_value("order:1", "a".to_string());

        cache.get("order:1").await.unwrap(); // miss
        cache.get_or_load("order:1", &loader).await.unwrap(); // miss, hit
        cache.get("order:1").await.unwrap(); // hit
        cache.get_or_load("order:2", &loader).await.unwrap(); // miss, negative hit
        cache.get("order:2").await.unwrap(); // negative hit

        if enabled {
            assert_stats(cache.stats_snapshot(), 2, 2, 3);
            assert_eq!(cache.hits(), 2);
            assert_eq!(cache.negative_hits(), 2);
            assert_eq!(cache.misses(), 3);
        } else {
            assert_stats(cache.stats_snapshot(), 0, 0, 0);
        }
    }
}

#[tokio::test]
async fn test_lifecycle_listeners() {
    init_tracing();
    let cache: Cache<String, StringBackend> =
        Cache::new(orders_settings(), Arc::new(StringBackend::new())).unwrap();
    let listener = Arc::new(RecordingListener::new());
    let failing = Arc::new(RecordingListener::failing());
    cache.add_listener(listener.clone());
    cache.add_listener(failing.clone() as Arc<dyn LifecycleListener>);

    cache.start().unwrap();
    cache.start().unwrap();
    assert!(cache.is_started());
    cache.stop();
    cache.stop();
    assert!(!cache.is_started());

    let expected = vec!["started:orders".to_string(), "stopping:orders".to_string()];
    assert_eq!(listener.events(), expected);
    assert_eq!(failing.events(), expected);
}

#[tokio::test(start_paused = true)]
async fn test_restart_keeps_delayed_eviction_working() {
    let (cache, backend) = fixtures::started_string_cache(orders_settings());
    cache.stop();
    cache.start().unwrap();

    cache.put("order:1", "a".to_string()).await.unwrap();
    cache.delay_remove("order:1", || async {}).await.unwrap();
    cache.put("order:1", "stale".to_string()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(backend.raw("order:1").await, None);
}

#[test]
fn test_start_outside_runtime_fails_with_delay_enabled() {
    let cache: Cache<String, StringBackend> =
        Cache::new(orders_settings(), Arc::new(StringBackend::new())).unwrap();
    assert!(cache.start().is_err());
    assert!(!cache.is_started());

    let cache: Cache<String, StringBackend> = Cache::new(
        orders_settings().with_delay_eviction_millis(0),
        Arc::new(StringBackend::new()),
    )
    .unwrap();
    assert!(cache.start().is_ok());
    cache.stop();
}
