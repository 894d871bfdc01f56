//! Core primitives for coordinating workers through a shared relational store.
//!
//! Three components share one [`ConnectionPool`]:
//!
//! - [`LockService`]: named mutexes stored as rows, with a liveness-aware
//!   expiry sweep
//! - [`WorkQueue`]: multi-queue dequeuer handing out [`Lease`]s with
//!   at-least-once delivery
//! - [`ServerRegistry`]: heartbeat table answering which lock owners are alive
//!
//! Backends plug in by implementing [`ConnectionManager`] and the statement
//! traits in [`traits`].

pub mod backoff;
pub mod cancel;
pub mod error;
pub mod lease;
pub mod lock;
pub mod pool;
pub mod prelude;
pub mod queue;
pub mod server;
pub mod traits;

pub use error::{CoordError, CoordResult};
pub use prelude::*;
