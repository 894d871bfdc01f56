//! Shared fixtures for the integration tests.

#![allow(dead_code)]

pub mod static_liveness;

use std::time::Duration;

use sqlcoord_core::lock::{LockOptions, LockService};
use sqlcoord_core::pool::PoolOptions;
use sqlcoord_core::queue::{QueueOptions, WorkQueue};
use sqlcoord_memory::{MemoryConnectionManager, MemoryStore};

pub type MemoryLockService = LockService<MemoryConnectionManager>;
pub type MemoryWorkQueue = WorkQueue<MemoryConnectionManager>;

/// Lock options with short backoff so contended tests finish quickly.
pub fn fast_lock_options(acquirer: &str) -> LockOptions {
    LockOptions {
        acquirer: acquirer.to_string(),
        min_backoff: Duration::from_millis(2),
        max_backoff: Duration::from_millis(20),
        ..LockOptions::default()
    }
}

/// A lock service with its own pool over `store`.
pub fn lock_service(store: &MemoryStore, acquirer: &str) -> MemoryLockService {
    let pool = store.pool(PoolOptions::default()).unwrap();
    LockService::new(pool, fast_lock_options(acquirer)).unwrap()
}

/// A work queue with its own pool over `store`.
pub fn work_queue(store: &MemoryStore, poll_interval: Duration) -> MemoryWorkQueue {
    let pool = store.pool(PoolOptions::default()).unwrap();
    let options = QueueOptions {
        poll_interval,
        ..QueueOptions::default()
    };
    WorkQueue::new(pool, options).unwrap()
}

/// Polls `condition` every few milliseconds until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
