//! In-process store backend for sqlcoord.
//!
//! [`MemoryStore`] keeps the lock, queue item and server tables behind a
//! single mutex and implements the same store traits as the Postgres
//! backend. It is meant for tests and single-process deployments, and lets
//! tests move the store clock, break connections and inject serialization
//! conflicts.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use sqlcoord_core::prelude::*;
//! use sqlcoord_memory::MemoryStore;
//!
//! # async fn example() -> CoordResult<()> {
//! let store = MemoryStore::new();
//! let locks = LockService::new(store.pool(PoolOptions::default())?, LockOptions::default())?;
//! let mut handle = locks.acquire_lock("report", Duration::from_secs(5)).await?;
//! handle.release().await?;
//! # Ok(())
//! # }
//! ```

mod connection;
mod state;
mod store;

pub use connection::{MemoryConnection, MemoryConnectionManager};
pub use store::{MemoryStore, QueueItemRecord};
