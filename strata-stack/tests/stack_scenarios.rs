//! End-to-end scenarios for the cache stack.
//!
//! Time is driven by a manual clock pinned at 2024-01-01T00:00:00Z, so
//! expiry and staleness transitions are exact.

use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strata_stack::{
    CacheEntry, CacheLayer, CacheSettings, CacheStack, CacheUpdateType, MemoryCacheLayer,
    StrataError,
};
use strata_core::Clock;
use strata_test_utils::{ExtensionEvent, FlakyLayer, ManualClock, RecordingExtension};

fn single_layer_stack(clock: &ManualClock) -> CacheStack<i32> {
    CacheStack::builder()
        .layer(MemoryCacheLayer::with_clock(Arc::new(clock.clone())))
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap()
}

/// Poll until `condition` holds; panics after a bounded number of attempts.
async fn eventually<F, Fut>(mut condition: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

// ============================================================================
// S1: miss then hit
// ============================================================================

#[tokio::test]
async fn miss_then_hit_invokes_factory_once() {
    let clock = ManualClock::at_epoch();
    let stack = single_layer_stack(&clock);
    let settings = CacheSettings::new(Duration::from_secs(60));
    let invocations = Arc::new(AtomicUsize::new(0));

    let counter = invocations.clone();
    let value = stack
        .get_or_set(
            "a",
            move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(42)
            },
            &settings,
        )
        .await
        .unwrap();
    assert_eq!(value, 42);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    clock.advance(Duration::from_secs(1));

    let counter = invocations.clone();
    let value = stack
        .get_or_set(
            "a",
            move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(99)
            },
            &settings,
        )
        .await
        .unwrap();
    assert_eq!(value, 42);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

// ============================================================================
// S2: single-flight under contention
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn contended_key_shares_one_factory_invocation() {
    let clock = ManualClock::at_epoch();
    let stack = single_layer_stack(&clock);
    let settings = CacheSettings::new(Duration::from_secs(86_400));
    let invocations = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::with_capacity(1000);
    for i in 0..1000i32 {
        let stack = stack.clone();
        let settings = settings.clone();
        let counter = invocations.clone();
        tasks.push(tokio::spawn(async move {
            stack
                .get_or_set(
                    "k",
                    move |_| async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, Infallible>(i)
                    },
                    &settings,
                )
                .await
                .unwrap()
        }));
    }

    let mut results = Vec::with_capacity(1000);
    for task in tasks {
        results.push(task.await.unwrap());
    }

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    let winner = results[0];
    assert!(results.iter().all(|&v| v == winner));
}

// ============================================================================
// S3: unique keys do not serialize
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unique_keys_each_get_their_own_factory() {
    let clock = ManualClock::at_epoch();
    let stack = single_layer_stack(&clock);
    let settings = CacheSettings::new(Duration::from_secs(86_400));
    let invocations = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::with_capacity(1000);
    for i in 0..1000i32 {
        let stack = stack.clone();
        let settings = settings.clone();
        let counter = invocations.clone();
        tasks.push(tokio::spawn(async move {
            let value = stack
                .get_or_set(
                    &format!("k_{i}"),
                    move |_| async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, Infallible>(i)
                    },
                    &settings,
                )
                .await
                .unwrap();
            (i, value)
        }));
    }

    for task in tasks {
        let (i, value) = task.await.unwrap();
        assert_eq!(value, i);
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 1000);
}

// ============================================================================
// S4: stale-while-revalidate
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_hit_returns_immediately_and_refreshes_in_background() {
    let clock = ManualClock::at_epoch();
    let stack = single_layer_stack(&clock);
    let settings =
        CacheSettings::new(Duration::from_secs(100)).with_stale_after(Duration::from_secs(30));

    stack.set("x", 1, Duration::from_secs(100)).await.unwrap();

    // Inside the stale window: expiry - stale_after has passed, expiry has not.
    clock.advance(Duration::from_secs(80));

    let value = stack
        .get_or_set("x", |_| async { Ok::<_, Infallible>(2) }, &settings)
        .await
        .unwrap();
    assert_eq!(value, 1, "stale value is served without waiting");

    let probe = stack.clone();
    eventually(
        move || {
            let probe = probe.clone();
            async move { probe.get("x").await.unwrap().map(|e| e.value) == Some(2) }
        },
        "background refresh to land",
    )
    .await;

    // The refreshed entry carries a fresh expiry from the stale-read instant.
    clock.advance(Duration::from_secs(1));
    let entry = stack.get("x").await.unwrap().unwrap();
    assert_eq!(entry.value, 2);
    assert!(!entry.is_expired(clock.now()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_read_latency_is_independent_of_factory_latency() {
    let clock = ManualClock::at_epoch();
    let stack = single_layer_stack(&clock);
    let settings =
        CacheSettings::new(Duration::from_secs(100)).with_stale_after(Duration::from_secs(30));

    stack.set("x", 1, Duration::from_secs(100)).await.unwrap();
    clock.advance(Duration::from_secs(80));

    // A factory that never completes must not block the stale read.
    let value = tokio::time::timeout(
        Duration::from_secs(1),
        stack.get_or_set(
            "x",
            |_| futures::future::pending::<Result<i32, Infallible>>(),
            &settings,
        ),
    )
    .await
    .expect("stale read must not wait on the factory")
    .unwrap();
    assert_eq!(value, 1);
}

// ============================================================================
// S5: back-population
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lower_layer_hit_back_populates_upper_layers() {
    let clock = ManualClock::at_epoch();
    let l0 = Arc::new(MemoryCacheLayer::<i32>::with_clock(Arc::new(clock.clone())));
    let l1 = Arc::new(MemoryCacheLayer::<i32>::with_clock(Arc::new(clock.clone())));
    let stack = CacheStack::builder()
        .shared_layer(l0.clone())
        .shared_layer(l1.clone())
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    let settings = CacheSettings::new(Duration::from_secs(3600));

    // Seed only the bottom layer.
    let entry = CacheEntry::with_ttl(7, clock.now(), Duration::from_secs(3600));
    l1.set("y", entry.clone()).await.unwrap();
    assert!(l0.get("y").await.unwrap().is_none());

    let value = stack
        .get_or_set(
            "y",
            |_| async { Err::<i32, _>("factory must not run on a warm hit") },
            &settings,
        )
        .await
        .unwrap();
    assert_eq!(value, 7);

    let probe = l0.clone();
    eventually(
        move || {
            let probe = probe.clone();
            async move { probe.get("y").await.unwrap().is_some() }
        },
        "back-population into the top layer",
    )
    .await;
    assert_eq!(l0.get("y").await.unwrap().unwrap(), entry);
}

// ============================================================================
// S6: expired entry forces a synchronous refresh
// ============================================================================

#[tokio::test]
async fn expired_entry_triggers_blocking_refresh() {
    let clock = ManualClock::at_epoch();
    let stack = single_layer_stack(&clock);
    let settings = CacheSettings::new(Duration::from_secs(10));
    let invocations = Arc::new(AtomicUsize::new(0));

    stack.set("z", 1, Duration::from_secs(10)).await.unwrap();
    clock.advance(Duration::from_secs(20));

    let counter = invocations.clone();
    let value = stack
        .get_or_set(
            "z",
            move |previous| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(previous, Some(1), "factory sees the expired value");
                Ok::<_, Infallible>(2)
            },
            &settings,
        )
        .await
        .unwrap();
    assert_eq!(value, 2);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Layer failure behavior
// ============================================================================

#[tokio::test]
async fn unavailable_top_layer_falls_through_without_refresh() {
    let clock = ManualClock::at_epoch();
    let flaky = Arc::new(FlakyLayer::new(MemoryCacheLayer::<i32>::with_clock(
        Arc::new(clock.clone()),
    )));
    let l1 = Arc::new(MemoryCacheLayer::<i32>::with_clock(Arc::new(clock.clone())));
    let stack = CacheStack::builder()
        .shared_layer(flaky.clone())
        .shared_layer(l1.clone())
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    let settings = CacheSettings::new(Duration::from_secs(3600));

    l1.set("k", CacheEntry::with_ttl(5, clock.now(), Duration::from_secs(3600)))
        .await
        .unwrap();
    flaky.set_available(false);

    // The outage must not be classified as a miss that triggers a refresh.
    let value = stack
        .get_or_set(
            "k",
            |_| async { Err::<i32, _>("outage must not stampede the factory") },
            &settings,
        )
        .await
        .unwrap();
    assert_eq!(value, 5);
}

#[tokio::test]
async fn failing_top_layer_read_is_treated_as_unavailable() {
    let clock = ManualClock::at_epoch();
    let flaky = Arc::new(FlakyLayer::new(MemoryCacheLayer::<i32>::with_clock(
        Arc::new(clock.clone()),
    )));
    let l1 = Arc::new(MemoryCacheLayer::<i32>::with_clock(Arc::new(clock.clone())));
    let stack = CacheStack::builder()
        .shared_layer(flaky.clone())
        .shared_layer(l1.clone())
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();

    l1.set("k", CacheEntry::with_ttl(9, clock.now(), Duration::from_secs(60)))
        .await
        .unwrap();
    flaky.set_fail_reads(true);

    let entry = stack.get("k").await.unwrap().unwrap();
    assert_eq!(entry.value, 9);
}

#[tokio::test]
async fn write_failure_during_refresh_propagates() {
    let clock = ManualClock::at_epoch();
    let flaky = Arc::new(FlakyLayer::new(MemoryCacheLayer::<i32>::with_clock(
        Arc::new(clock.clone()),
    )));
    let stack = CacheStack::builder()
        .shared_layer(flaky.clone())
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    let settings = CacheSettings::new(Duration::from_secs(60));

    flaky.set_fail_writes(true);
    let err = stack
        .get_or_set("k", |_| async { Ok::<_, Infallible>(1) }, &settings)
        .await
        .unwrap_err();
    assert!(matches!(err, StrataError::Layer(_)));
}

// ============================================================================
// Extension pipeline observation
// ============================================================================

#[tokio::test]
async fn extension_observes_refresh_update_eviction_flush_teardown() {
    let clock = ManualClock::at_epoch();
    let recording = Arc::new(RecordingExtension::new());
    let stack = CacheStack::builder()
        .layer(MemoryCacheLayer::<i32>::with_clock(Arc::new(clock.clone())))
        .shared_extension(recording.clone())
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    let settings = CacheSettings::new(Duration::from_secs(60));

    stack
        .get_or_set("k", |_| async { Ok::<_, Infallible>(1) }, &settings)
        .await
        .unwrap();
    stack.evict("k").await.unwrap();
    stack.flush().await.unwrap();
    stack.dispose().await.unwrap();

    let events = recording.events();
    assert_eq!(events[0], ExtensionEvent::Attached);
    assert!(events.contains(&ExtensionEvent::RefreshStarted {
        key: "k".to_string()
    }));
    assert!(events.contains(&ExtensionEvent::Updated {
        key: "k".to_string(),
        update_type: CacheUpdateType::AddEntry,
    }));
    assert!(events.contains(&ExtensionEvent::Evicted {
        key: "k".to_string()
    }));
    assert!(events.contains(&ExtensionEvent::Flushed));
    assert_eq!(events.last(), Some(&ExtensionEvent::TornDown));
}

#[tokio::test]
async fn direct_set_reports_add_or_update() {
    let clock = ManualClock::at_epoch();
    let recording = Arc::new(RecordingExtension::new());
    let stack = CacheStack::builder()
        .layer(MemoryCacheLayer::<i32>::with_clock(Arc::new(clock.clone())))
        .shared_extension(recording.clone())
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();

    stack.set("k", 3, Duration::from_secs(60)).await.unwrap();

    assert!(recording.events().contains(&ExtensionEvent::Updated {
        key: "k".to_string(),
        update_type: CacheUpdateType::AddOrUpdateEntry,
    }));
}
