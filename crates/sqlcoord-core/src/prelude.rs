//! Convenience prelude for sqlcoord types.

pub use crate::cancel::{CancelSource, CancelToken};
pub use crate::error::{CoordError, CoordResult};
pub use crate::lease::{Lease, LeaseState};
pub use crate::lock::{LockHandle, LockOptions, LockService};
pub use crate::pool::{ConnectionPool, PoolOptions, PoolStatus, PooledConnection};
pub use crate::queue::{QueueOptions, WorkQueue};
pub use crate::server::{ServerOptions, ServerRegistry};
pub use crate::traits::{
    ClaimedItem, ConnectionManager, LivenessRegistry, LockStore, QueueStore, ServerStore,
    StoreConnection,
};
