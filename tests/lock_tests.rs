//! Integration tests for the lock service over the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use sqlcoord_core::cancel::{self, CancelSource};
use sqlcoord_core::error::CoordError;
use sqlcoord_core::lock::LockService;
use sqlcoord_core::pool::PoolOptions;
use sqlcoord_core::server::{ServerOptions, ServerRegistry};
use sqlcoord_memory::MemoryStore;

mod common;
use common::static_liveness::StaticLiveness;
use common::{eventually, fast_lock_options, lock_service};

const EXPIRY: Duration = Duration::from_secs(10 * 60);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_never_share_the_critical_section() {
    const WORKERS: u64 = 8;
    let store = MemoryStore::new();
    let counter = Arc::new(AtomicU64::new(0));

    let mut tasks = Vec::new();
    for worker in 0..WORKERS {
        let service = lock_service(&store, &format!("worker-{worker}"));
        let counter = Arc::clone(&counter);
        tasks.push(tokio::spawn(async move {
            let mut handle = service
                .acquire_lock("counter", Duration::from_secs(10))
                .await
                .unwrap();
            // Non-atomic read-modify-write: only correct under mutual exclusion.
            let seen = counter.load(Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            counter.store(seen + 1, Ordering::SeqCst);
            handle.release().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(counter.load(Ordering::SeqCst), WORKERS);
    assert_eq!(store.lock_count(), 0);
}

#[tokio::test]
async fn test_acquire_times_out_while_held() {
    let store = MemoryStore::new();
    let holder = lock_service(&store, "holder");
    let waiter = lock_service(&store, "waiter");

    let _handle = holder
        .acquire_lock("report", Duration::from_secs(1))
        .await
        .unwrap();

    let start = Instant::now();
    let err = waiter
        .acquire_lock("report", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(start.elapsed() >= Duration::from_millis(100));
    match err {
        CoordError::LockTimeout { resource, timeout } => {
            assert_eq!(resource, "report");
            assert_eq!(timeout, Duration::from_millis(100));
        }
        other => panic!("expected LockTimeout, got {other:?}"),
    }
    assert_eq!(store.lock_owner("report").as_deref(), Some("holder"));
}

#[tokio::test]
async fn test_acquire_times_out_while_pool_is_saturated() {
    let store = MemoryStore::new();
    let pool = store
        .pool(PoolOptions {
            max_size: 1,
            ..PoolOptions::default()
        })
        .unwrap();
    let service = LockService::new(pool.clone(), fast_lock_options("waiter")).unwrap();
    let _held = pool.acquire().await.unwrap();

    let start = Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        service.acquire_lock("report", Duration::from_millis(100)),
    )
    .await
    .expect("acquire_lock must honour its timeout while waiting for a connection");

    assert!(matches!(result, Err(CoordError::LockTimeout { .. })));
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(store.lock_count(), 0);
    assert_eq!(pool.status().live, 1);
}

#[tokio::test]
async fn test_waiter_acquires_after_release() {
    let store = MemoryStore::new();
    let holder = lock_service(&store, "holder");
    let waiter = lock_service(&store, "waiter");

    let mut handle = holder
        .acquire_lock("report", Duration::from_secs(1))
        .await
        .unwrap();
    let task =
        tokio::spawn(async move { waiter.acquire_lock("report", Duration::from_secs(5)).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    holder.release_lock(&mut handle).await.unwrap();

    let mut acquired = task.await.unwrap().unwrap();
    assert_eq!(acquired.acquirer(), "waiter");
    assert_eq!(store.lock_owner("report").as_deref(), Some("waiter"));
    acquired.release().await.unwrap();
}

#[tokio::test]
async fn test_second_release_is_a_violation() {
    let store = MemoryStore::new();
    let service = lock_service(&store, "owner");

    let mut handle = service
        .acquire_lock("report", Duration::from_secs(1))
        .await
        .unwrap();
    handle.release().await.unwrap();

    let err = handle.release().await.unwrap_err();
    assert!(matches!(
        err,
        CoordError::LockViolation { ref resource, ref acquirer }
            if resource == "report" && acquirer == "owner"
    ));
}

#[tokio::test]
async fn test_failed_release_is_retried_on_drop() {
    let store = MemoryStore::new();
    let service = lock_service(&store, "owner");
    let mut handle = service
        .acquire_lock("report", Duration::from_secs(1))
        .await
        .unwrap();

    store.inject_statement_failures(1);
    assert!(matches!(handle.release().await, Err(CoordError::Backend(_))));
    assert_eq!(store.lock_owner("report").as_deref(), Some("owner"));

    drop(handle);
    assert!(eventually(Duration::from_secs(1), || store.lock_count() == 0).await);
}

#[tokio::test]
async fn test_release_cannot_delete_another_acquirers_lock() {
    let store = MemoryStore::new();
    let first = lock_service(&store, "first");
    let second = lock_service(&store, "second");
    let liveness = StaticLiveness::new(["second"]);

    let mut stale = first
        .acquire_lock("report", Duration::from_secs(1))
        .await
        .unwrap();
    store.advance_clock(EXPIRY + Duration::from_secs(1));
    assert_eq!(first.sweep_expired(&liveness).await.unwrap(), 1);

    let mut current = second
        .acquire_lock("report", Duration::from_secs(1))
        .await
        .unwrap();

    assert!(matches!(
        stale.release().await,
        Err(CoordError::LockViolation { .. })
    ));
    assert_eq!(store.lock_owner("report").as_deref(), Some("second"));
    current.release().await.unwrap();
}

#[tokio::test]
async fn test_sweep_keeps_locks_of_live_owners() {
    let store = MemoryStore::new();
    let alive = lock_service(&store, "alive");
    let crashed = lock_service(&store, "crashed");
    let liveness = StaticLiveness::new(["alive"]);

    let _slow = alive
        .acquire_lock("slow-job", Duration::from_secs(1))
        .await
        .unwrap();
    let abandoned = crashed
        .acquire_lock("abandoned-job", Duration::from_secs(1))
        .await
        .unwrap();
    // The crashed process never releases.
    std::mem::forget(abandoned);

    assert_eq!(alive.sweep_expired(&liveness).await.unwrap(), 0);

    store.advance_clock(EXPIRY + Duration::from_secs(1));
    assert_eq!(alive.sweep_expired(&liveness).await.unwrap(), 1);

    assert_eq!(store.lock_owner("slow-job").as_deref(), Some("alive"));
    assert!(store.lock_owner("abandoned-job").is_none());

    liveness.kill("alive");
    assert_eq!(alive.sweep_expired(&liveness).await.unwrap(), 1);
    assert_eq!(store.lock_count(), 0);
}

#[tokio::test]
async fn test_sweep_consults_server_registry() {
    let store = MemoryStore::new();
    let service = lock_service(&store, "node-a");
    let other = lock_service(&store, "node-b");
    let registry = ServerRegistry::new(
        store.pool(PoolOptions::default()).unwrap(),
        ServerOptions::default(),
    )
    .unwrap();

    registry.announce("node-a").await.unwrap();
    registry.announce("node-b").await.unwrap();
    let _a = service
        .acquire_lock("a", Duration::from_secs(1))
        .await
        .unwrap();
    std::mem::forget(other.acquire_lock("b", Duration::from_secs(1)).await.unwrap());

    store.advance_clock(EXPIRY + Duration::from_secs(1));
    // Only node-a kept heartbeating.
    registry.heartbeat("node-a").await.unwrap();

    assert_eq!(registry.live_servers().await.unwrap(), vec!["node-a".to_string()]);
    assert_eq!(service.sweep_expired(&registry).await.unwrap(), 1);
    assert_eq!(store.lock_owner("a").as_deref(), Some("node-a"));
    assert!(store.lock_owner("b").is_none());
}

#[tokio::test]
async fn test_cancel_interrupts_waiting_acquire() {
    let store = MemoryStore::new();
    let holder = lock_service(&store, "holder");
    let waiter = lock_service(&store, "waiter");
    let _handle = holder
        .acquire_lock("report", Duration::from_secs(1))
        .await
        .unwrap();

    let start = Instant::now();
    let err = waiter
        .acquire_lock_with_cancel(
            "report",
            Duration::from_secs(60),
            &cancel::after(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CoordError::Cancelled));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_try_acquire_does_not_wait() {
    let store = MemoryStore::new();
    let a = lock_service(&store, "a");
    let b = lock_service(&store, "b");

    let mut handle = a.try_acquire_lock("report").await.unwrap().unwrap();
    assert!(b.try_acquire_lock("report").await.unwrap().is_none());
    handle.release().await.unwrap();
    assert!(b.try_acquire_lock("report").await.unwrap().is_some());
}

#[tokio::test]
async fn test_dropped_handle_releases_lock() {
    let store = MemoryStore::new();
    let service = lock_service(&store, "owner");

    let handle = service
        .acquire_lock("report", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(store.lock_count(), 1);
    drop(handle);

    assert!(eventually(Duration::from_secs(1), || store.lock_count() == 0).await);
}

#[tokio::test]
async fn test_empty_resource_is_rejected() {
    let store = MemoryStore::new();
    let service = lock_service(&store, "owner");
    assert!(matches!(
        service.acquire_lock("", Duration::from_secs(1)).await,
        Err(CoordError::InvalidName(_))
    ));
    assert!(matches!(
        service.try_acquire_lock("").await,
        Err(CoordError::InvalidName(_))
    ));
}

#[tokio::test]
async fn test_empty_acquirer_is_rejected() {
    let store = MemoryStore::new();
    let pool = store.pool(PoolOptions::default()).unwrap();
    assert!(matches!(
        LockService::new(pool, fast_lock_options("")),
        Err(CoordError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_background_sweep_reclaims_until_cancelled() {
    let store = MemoryStore::new();
    let crashed = lock_service(&store, "crashed");
    std::mem::forget(
        crashed
            .acquire_lock("abandoned", Duration::from_secs(1))
            .await
            .unwrap(),
    );
    store.advance_clock(EXPIRY + Duration::from_secs(1));

    let mut options = fast_lock_options("sweeper");
    options.sweep_interval = Duration::from_millis(10);
    let sweeper = LockService::new(store.pool(PoolOptions::default()).unwrap(), options).unwrap();

    let source = CancelSource::new();
    let task = sweeper.spawn_expiry_sweep(StaticLiveness::default(), source.token());

    assert!(eventually(Duration::from_secs(1), || store.lock_count() == 0).await);
    source.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_server_heartbeat_lifecycle() {
    let store = MemoryStore::new();
    let registry = ServerRegistry::new(
        store.pool(PoolOptions::default()).unwrap(),
        ServerOptions {
            heartbeat_interval: Duration::from_millis(10),
            server_timeout: Duration::from_secs(60),
        },
    )
    .unwrap();

    let source = CancelSource::new();
    let task = registry.spawn_heartbeat("node-a".to_string(), source.token());
    assert!(
        eventually(Duration::from_secs(1), || {
            store.server_ids() == vec!["node-a".to_string()]
        })
        .await
    );

    registry.announce("node-old").await.unwrap();
    store.advance_clock(Duration::from_secs(61));
    // node-a refreshes on its next tick; node-old does not.
    assert!(
        eventually(Duration::from_secs(1), || {
            store
                .heartbeat_age("node-a")
                .is_some_and(|age| age < Duration::from_secs(60))
        })
        .await
    );
    assert_eq!(registry.remove_timed_out().await.unwrap(), 1);
    assert_eq!(store.server_ids(), vec!["node-a".to_string()]);

    source.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
    assert!(store.server_ids().is_empty());
}

#[tokio::test]
async fn test_registry_rejects_bad_configuration() {
    let store = MemoryStore::new();
    let pool = store.pool(PoolOptions::default()).unwrap();
    let err = ServerRegistry::new(
        pool,
        ServerOptions {
            heartbeat_interval: Duration::from_secs(60),
            server_timeout: Duration::from_secs(60),
        },
    )
    .unwrap_err();
    assert!(matches!(err, CoordError::Configuration(_)));
}
