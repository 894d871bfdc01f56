//! A consumer's claim over one queue item.

use std::fmt;

use tracing::{debug, instrument, warn};

use crate::error::CoordResult;
use crate::pool::ConnectionPool;
use crate::traits::{ClaimedItem, ConnectionManager, QueueStore};

/// Lifecycle of a [`Lease`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// The item is claimed by this consumer.
    Claimed,
    /// The item was deleted from its queue.
    Acknowledged,
    /// The item was handed back to its queue.
    Requeued,
}

/// A claimed queue item.
///
/// Resolve it with [`acknowledge`](Self::acknowledge) once the work is done,
/// or [`requeue`](Self::requeue) to hand it back. A lease dropped while
/// still claimed requeues its item in the background, so an unfinished item
/// is delivered again rather than lost.
pub struct Lease<M: ConnectionManager>
where
    M::Connection: QueueStore,
{
    item: ClaimedItem,
    pool: ConnectionPool<M>,
    state: LeaseState,
}

impl<M: ConnectionManager> Lease<M>
where
    M::Connection: QueueStore,
{
    pub(crate) fn new(item: ClaimedItem, pool: ConnectionPool<M>) -> Self {
        Self {
            item,
            pool,
            state: LeaseState::Claimed,
        }
    }

    /// Returns the queue item id.
    pub fn id(&self) -> i64 {
        self.item.id
    }

    /// Returns the opaque job reference.
    pub fn job_ref(&self) -> &str {
        &self.item.job_ref
    }

    /// Returns the queue the item was claimed from.
    pub fn queue_name(&self) -> &str {
        &self.item.queue_name
    }

    /// Returns the current state.
    pub fn state(&self) -> LeaseState {
        self.state
    }

    /// Deletes the item from its queue.
    ///
    /// No-op once the lease is resolved. A row that already vanished is not
    /// an error. On failure the lease stays claimed.
    #[instrument(skip(self), fields(id = self.item.id, queue = %self.item.queue_name))]
    pub async fn acknowledge(&mut self) -> CoordResult<()> {
        if self.state != LeaseState::Claimed {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await?;
        let deleted = conn.connection()?.delete_queue_item(self.item.id).await?;
        if deleted == 0 {
            debug!("acknowledged item was already gone");
        }
        self.state = LeaseState::Acknowledged;
        Ok(())
    }

    /// Alias of [`acknowledge`](Self::acknowledge).
    pub async fn remove_from_queue(&mut self) -> CoordResult<()> {
        self.acknowledge().await
    }

    /// Hands the item back to its queue, visible to other consumers at once.
    ///
    /// No-op once the lease is resolved. On failure the lease stays claimed.
    #[instrument(skip(self), fields(id = self.item.id, queue = %self.item.queue_name))]
    pub async fn requeue(&mut self) -> CoordResult<()> {
        if self.state != LeaseState::Claimed {
            return Ok(());
        }
        requeue_item(&self.pool, self.item.id).await?;
        self.state = LeaseState::Requeued;
        Ok(())
    }
}

async fn requeue_item<M: ConnectionManager>(pool: &ConnectionPool<M>, id: i64) -> CoordResult<()>
where
    M::Connection: QueueStore,
{
    let mut conn = pool.acquire().await?;
    let updated = conn.connection()?.requeue_queue_item(id).await?;
    if updated == 0 {
        debug!(id, "requeued item was already gone");
    }
    Ok(())
}

impl<M: ConnectionManager> Drop for Lease<M>
where
    M::Connection: QueueStore,
{
    fn drop(&mut self) {
        if self.state != LeaseState::Claimed {
            return;
        }
        let id = self.item.id;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                id,
                "lease dropped outside a runtime; item returns after the invisibility timeout"
            );
            return;
        };

        let pool = self.pool.clone();
        runtime.spawn(async move {
            if let Err(e) = requeue_item(&pool, id).await {
                warn!(id, error = %e, "failed to requeue dropped lease");
            }
        });
    }
}

impl<M: ConnectionManager> fmt::Debug for Lease<M>
where
    M::Connection: QueueStore,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.item.id)
            .field("job_ref", &self.item.job_ref)
            .field("queue_name", &self.item.queue_name)
            .field("state", &self.state)
            .finish()
    }
}
