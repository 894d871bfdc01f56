//! Multi-queue work dequeuer with at-least-once delivery.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, trace};

use crate::cancel::{self, CancelToken};
use crate::error::{CoordError, CoordResult};
use crate::lease::Lease;
use crate::pool::ConnectionPool;
use crate::traits::{ConnectionManager, QueueStore};

/// Configuration for a [`WorkQueue`].
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Wait between claim attempts that find nothing.
    pub poll_interval: Duration,
    /// Time after which a claimed but unacknowledged item can be claimed again.
    pub invisibility_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            invisibility_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Enqueues work items and claims them across prioritized queues.
pub struct WorkQueue<M: ConnectionManager>
where
    M::Connection: QueueStore,
{
    pool: ConnectionPool<M>,
    options: Arc<QueueOptions>,
}

impl<M: ConnectionManager> WorkQueue<M>
where
    M::Connection: QueueStore,
{
    /// Creates a queue that runs its statements through `pool`.
    pub fn new(pool: ConnectionPool<M>, options: QueueOptions) -> CoordResult<Self> {
        if options.poll_interval.is_zero() {
            return Err(CoordError::Configuration(
                "queue poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            pool,
            options: Arc::new(options),
        })
    }

    /// Returns the queue configuration.
    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Adds an unclaimed item to `queue_name` and returns its id.
    #[instrument(skip(self))]
    pub async fn enqueue(&self, queue_name: &str, job_ref: &str) -> CoordResult<i64> {
        validate_queue_name(queue_name)?;
        let mut conn = self.pool.acquire().await?;
        let id = conn
            .connection()?
            .insert_queue_item(queue_name, job_ref)
            .await?;
        debug!(id, "enqueued");
        Ok(id)
    }

    /// Makes one claim attempt across `queue_names`.
    ///
    /// Serialization conflicts are retried immediately; `Ok(None)` means no
    /// item is currently eligible.
    pub async fn try_dequeue<S: AsRef<str> + Sync>(
        &self,
        queue_names: &[S],
    ) -> CoordResult<Option<Lease<M>>> {
        let queue_names = normalize_queue_names(queue_names)?;
        self.claim(&queue_names, &cancel::never()).await
    }

    /// Claims the next item across `queue_names`, waiting until one is
    /// available or `cancel` fires.
    ///
    /// Earlier names in `queue_names` take priority; within a queue the
    /// oldest item wins.
    #[instrument(skip_all, fields(queue_count = queue_names.len()))]
    pub async fn dequeue<S: AsRef<str> + Sync>(
        &self,
        queue_names: &[S],
        cancel: &CancelToken,
    ) -> CoordResult<Lease<M>> {
        let queue_names = normalize_queue_names(queue_names)?;
        loop {
            cancel::check(cancel)?;
            if let Some(lease) = self.claim(&queue_names, cancel).await? {
                return Ok(lease);
            }
            trace!(poll_interval = ?self.options.poll_interval, "no eligible item");
            cancel::sleep(self.options.poll_interval, cancel).await?;
        }
    }

    async fn claim(
        &self,
        queue_names: &[String],
        cancel: &CancelToken,
    ) -> CoordResult<Option<Lease<M>>> {
        let mut conn = self.pool.acquire_with_cancel(cancel).await?;
        loop {
            cancel::check(cancel)?;
            let claimed = conn
                .connection()?
                .claim_queue_item(queue_names, self.options.invisibility_timeout)
                .await;
            match claimed {
                Ok(Some(item)) => {
                    debug!(id = item.id, queue = %item.queue_name, "claimed item");
                    return Ok(Some(Lease::new(item, self.pool.clone())));
                }
                Ok(None) => return Ok(None),
                Err(CoordError::SerializationConflict(e)) => {
                    debug!(error = %e, "claim hit a serialization conflict, retrying");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<M: ConnectionManager> Clone for WorkQueue<M>
where
    M::Connection: QueueStore,
{
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            options: Arc::clone(&self.options),
        }
    }
}

impl<M: ConnectionManager> fmt::Debug for WorkQueue<M>
where
    M::Connection: QueueStore,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("options", &self.options)
            .finish()
    }
}

fn validate_queue_name(queue_name: &str) -> CoordResult<()> {
    if queue_name.is_empty() {
        return Err(CoordError::InvalidName(
            "queue name cannot be empty".to_string(),
        ));
    }
    Ok(())
}

fn normalize_queue_names<S: AsRef<str>>(queue_names: &[S]) -> CoordResult<Vec<String>> {
    if queue_names.is_empty() {
        return Err(CoordError::InvalidName(
            "at least one queue name is required".to_string(),
        ));
    }
    queue_names
        .iter()
        .map(|name| {
            let name = name.as_ref();
            validate_queue_name(name)?;
            Ok(name.to_string())
        })
        .collect()
}
