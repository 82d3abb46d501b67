//! Request cache: TTL, capacity, single flight, failure handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use conduit::{CacheConfig, CacheError, Fingerprint, RequestCache, Settings};
use futures::future::join_all;
use tokio::sync::Notify;

type Cache = RequestCache<Fingerprint<u64>, String, String>;

fn fp(key: u64) -> Fingerprint<u64> {
    Fingerprint::new("profile", key)
}

/// A compute closure that counts its invocations.
fn counted(counter: &Arc<AtomicUsize>, value: &str) -> impl FnOnce() -> futures::future::Ready<Result<String, String>> + Send {
    let counter = Arc::clone(counter);
    let value = value.to_owned();
    move || {
        counter.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(Ok(value))
    }
}

#[tokio::test(start_paused = true)]
async fn computes_once_within_ttl_and_again_after() {
    let cache = Cache::new(10, Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));

    assert_eq!(cache.get_or_compute(fp(1), counted(&calls, "v1")).await, Ok("v1".into()));
    tokio::time::advance(Duration::from_secs(59)).await;
    assert_eq!(cache.get_or_compute(fp(1), counted(&calls, "v2")).await, Ok("v1".into()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(cache.get_or_compute(fp(1), counted(&calls, "v2")).await, Ok("v2".into()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn inserting_past_capacity_evicts_the_oldest() {
    let cache = Cache::new(3, Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));

    for key in 0..4 {
        cache.get_or_compute(fp(key), counted(&calls, &key.to_string())).await.unwrap();
    }
    assert_eq!(cache.len(), 3);
    assert_eq!(cache.get(&fp(0)), None);
    assert_eq!(cache.get(&fp(3)), Some("3".into()));

    // the evicted fingerprint is a miss
    cache.get_or_compute(fp(0), counted(&calls, "0")).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(cache.len(), 3);
    assert_eq!(cache.get(&fp(1)), None, "1 was the oldest remaining");
}

#[tokio::test]
async fn concurrent_callers_join_one_computation() {
    let cache = Cache::new(10, Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());

    let compute = {
        let calls = Arc::clone(&calls);
        let release = Arc::clone(&release);
        move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            release.notified().await;
            Ok::<_, String>("shared".to_owned())
        }
    };
    let callers: Vec<_> = (0..5)
        .map(|_| {
            let cache = cache.clone();
            let compute = compute.clone();
            tokio::spawn(async move { cache.get_or_compute(fp(7), compute).await })
        })
        .collect();

    while calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    release.notify_one();

    for outcome in join_all(callers).await {
        assert_eq!(outcome.unwrap(), Ok("shared".into()));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn computation_survives_the_caller_that_started_it() {
    let cache = Cache::new(10, Duration::from_secs(60));
    let release = Arc::new(Notify::new());

    let starter = tokio::spawn({
        let cache = cache.clone();
        let release = Arc::clone(&release);
        async move {
            cache
                .get_or_compute(fp(1), move || async move {
                    release.notified().await;
                    Ok("done".to_owned())
                })
                .await
        }
    });
    tokio::task::yield_now().await;
    starter.abort();
    assert!(starter.await.unwrap_err().is_cancelled());

    release.notify_one();
    let joined = cache.get_or_compute(fp(1), || async { Err("recomputed".to_owned()) }).await;
    assert_eq!(joined, Ok("done".into()));
}

#[tokio::test]
async fn failures_are_shared_but_not_cached() {
    let cache = Cache::new(10, Duration::from_secs(60));

    let outcomes = join_all((0..3).map(|_| {
        cache.get_or_compute(fp(1), || async { Err::<String, _>("store down".to_owned()) })
    }))
    .await;
    for outcome in outcomes {
        assert_eq!(outcome, Err(CacheError::Compute("store down".into())));
    }
    assert!(cache.is_empty());

    let retried = cache.get_or_compute(fp(1), || async { Ok("back".to_owned()) }).await;
    assert_eq!(retried, Ok("back".into()));
}

#[test]
fn builds_from_settings() {
    let settings = Settings::from_toml_str("[cache]\ncapacity = 2\ntime_to_live = \"1m\"").unwrap();
    assert_eq!(settings.cache, CacheConfig { capacity: 2, time_to_live: Duration::from_secs(60) });
    let cache = Cache::from_config(&settings.cache);
    assert!(cache.is_empty());
}
