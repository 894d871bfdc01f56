//! Row-based distributed mutex.
//!
//! A lock is a row keyed by resource name. Whoever inserts the row holds
//! the lock; the store's unique constraint is the only arbiter. Rows carry
//! the acquirer identity of the holding service so that a release can
//! never delete a lock since re-acquired by someone else, and so that the
//! expiry sweep can tell abandoned locks from slow ones.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{Span, debug, info, instrument, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::cancel::{self, CancelToken};
use crate::error::{CoordError, CoordResult};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::traits::{ConnectionManager, LivenessRegistry, LockStore};

/// Configuration for a [`LockService`].
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Identity written into every lock row this service creates.
    pub acquirer: String,
    /// First wait after finding a lock held.
    pub min_backoff: Duration,
    /// Longest wait between acquisition attempts.
    pub max_backoff: Duration,
    /// Age after which a lock held by a dead owner is reclaimed.
    pub expiry_timeout: Duration,
    /// Cadence of the background expiry sweep.
    pub sweep_interval: Duration,
}

impl LockOptions {
    /// Generates an acquirer identity unique to this process instance.
    ///
    /// Format: `{process_id}:{uuid}`
    pub fn generate_acquirer() -> String {
        format!("{}:{}", std::process::id(), Uuid::new_v4())
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            acquirer: Self::generate_acquirer(),
            min_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            expiry_timeout: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Acquires and releases named locks stored as rows.
pub struct LockService<M: ConnectionManager>
where
    M::Connection: LockStore,
{
    pool: ConnectionPool<M>,
    options: Arc<LockOptions>,
}

impl<M: ConnectionManager> LockService<M>
where
    M::Connection: LockStore,
{
    /// Creates a service that runs its statements through `pool`.
    pub fn new(pool: ConnectionPool<M>, options: LockOptions) -> CoordResult<Self> {
        if options.acquirer.is_empty() {
            return Err(CoordError::Configuration(
                "lock acquirer identity cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            pool,
            options: Arc::new(options),
        })
    }

    /// Returns the acquirer identity of this service.
    pub fn acquirer(&self) -> &str {
        &self.options.acquirer
    }

    /// Returns the service configuration.
    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Attempts to take the lock once, without waiting.
    ///
    /// Returns `Ok(None)` if another acquirer holds it.
    #[instrument(skip(self), fields(acquirer = %self.options.acquirer))]
    pub async fn try_acquire_lock(&self, resource: &str) -> CoordResult<Option<LockHandle<M>>> {
        validate_resource(resource)?;
        let lease = self.pool.acquire().await?;
        self.insert_lock_row(lease, resource).await
    }

    /// Acquires the lock, waiting up to `timeout`.
    ///
    /// # Returns
    ///
    /// * `Ok(handle)` - Lock acquired
    /// * `Err(CoordError::LockTimeout)` - Still held by someone else after `timeout`
    /// * `Err(CoordError::Connection)` - The store could not be reached
    pub async fn acquire_lock(&self, resource: &str, timeout: Duration) -> CoordResult<LockHandle<M>> {
        self.acquire_lock_with_cancel(resource, timeout, &cancel::never())
            .await
    }

    /// Acquires the lock, waiting up to `timeout` unless `cancel` fires first.
    #[instrument(
        skip(self, cancel),
        fields(acquirer = %self.options.acquirer, timeout = ?timeout, attempts = tracing::field::Empty)
    )]
    pub async fn acquire_lock_with_cancel(
        &self,
        resource: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> CoordResult<LockHandle<M>> {
        validate_resource(resource)?;
        let start = Instant::now();
        // `None` when the timeout is too large to represent: wait without bound.
        let deadline = start.checked_add(timeout).map(tokio::time::Instant::from_std);
        let mut backoff = Backoff::new(self.options.min_backoff, self.options.max_backoff);
        let mut attempts = 0u32;
        let timed_out = |attempts: u32| {
            Span::current().record("attempts", attempts);
            CoordError::LockTimeout {
                resource: resource.to_string(),
                timeout,
            }
        };

        loop {
            cancel::check(cancel)?;
            attempts += 1;

            // A saturated pool counts against the same deadline as a held lock.
            let checkout = self.pool.acquire_with_cancel(cancel);
            let lease = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, checkout).await {
                    Ok(lease) => lease?,
                    Err(_) => return Err(timed_out(attempts)),
                },
                None => checkout.await?,
            };

            if let Some(handle) = self.insert_lock_row(lease, resource).await? {
                Span::current().record("attempts", attempts);
                debug!(elapsed_ms = start.elapsed().as_millis() as u64, "lock acquired");
                return Ok(handle);
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(timed_out(attempts));
            }

            let delay = backoff.next_delay().min(timeout - elapsed);
            cancel::sleep(delay, cancel).await?;
        }
    }

    /// Releases a held lock.
    ///
    /// Fails with [`CoordError::LockViolation`] if the row is gone.
    pub async fn release_lock(&self, handle: &mut LockHandle<M>) -> CoordResult<()> {
        handle.release().await
    }

    /// Deletes expired locks whose acquirer is not reported live.
    ///
    /// Returns the number of locks reclaimed.
    #[instrument(skip_all, fields(expiry_timeout = ?self.options.expiry_timeout))]
    pub async fn sweep_expired<R: LivenessRegistry>(&self, registry: &R) -> CoordResult<u64> {
        let live_owners = registry.live_owners().await?;
        let mut lease = self.pool.acquire().await?;
        let removed = lease
            .connection()?
            .delete_expired_locks(self.options.expiry_timeout, &live_owners)
            .await?;
        if removed > 0 {
            info!(removed, live_owners = live_owners.len(), "reclaimed abandoned locks");
        }
        Ok(removed)
    }

    /// Runs [`sweep_expired`](Self::sweep_expired) every `sweep_interval`
    /// until `cancel` fires.
    ///
    /// A failed pass is logged and retried on the next tick.
    pub fn spawn_expiry_sweep<R>(&self, registry: R, cancel: CancelToken) -> JoinHandle<()>
    where
        R: LivenessRegistry + 'static,
    {
        let service = self.clone();
        tokio::spawn(async move {
            let interval = service.options.sweep_interval;
            loop {
                if cancel::sleep(interval, &cancel).await.is_err() {
                    debug!("lock expiry sweep stopped");
                    break;
                }
                if let Err(e) = service.sweep_expired(&registry).await {
                    warn!(error = %e, "lock expiry sweep failed");
                }
            }
        })
    }

    async fn insert_lock_row(
        &self,
        mut lease: PooledConnection<M>,
        resource: &str,
    ) -> CoordResult<Option<LockHandle<M>>> {
        let inserted = lease
            .connection()?
            .try_insert_lock(resource, &self.options.acquirer)
            .await?;
        if !inserted {
            return Ok(None);
        }
        Ok(Some(LockHandle {
            resource: resource.to_string(),
            options: Arc::clone(&self.options),
            pool: self.pool.clone(),
            released: false,
        }))
    }
}

impl<M: ConnectionManager> Clone for LockService<M>
where
    M::Connection: LockStore,
{
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            options: Arc::clone(&self.options),
        }
    }
}

impl<M: ConnectionManager> fmt::Debug for LockService<M>
where
    M::Connection: LockStore,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockService")
            .field("acquirer", &self.options.acquirer)
            .finish()
    }
}

fn validate_resource(resource: &str) -> CoordResult<()> {
    if resource.is_empty() {
        return Err(CoordError::InvalidName(
            "lock resource cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// Handle to a held lock.
///
/// Dropping the handle without calling [`release`](Self::release) schedules
/// the release on the current tokio runtime. Call `release` explicitly to
/// observe a [`CoordError::LockViolation`].
pub struct LockHandle<M: ConnectionManager>
where
    M::Connection: LockStore,
{
    resource: String,
    options: Arc<LockOptions>,
    pool: ConnectionPool<M>,
    released: bool,
}

impl<M: ConnectionManager> LockHandle<M>
where
    M::Connection: LockStore,
{
    /// Returns the locked resource name.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Returns the acquirer identity recorded in the lock row.
    pub fn acquirer(&self) -> &str {
        &self.options.acquirer
    }

    /// Deletes the lock row.
    ///
    /// Every call issues the delete. A second call therefore fails with
    /// [`CoordError::LockViolation`], as does releasing a lock that expired
    /// or was removed by someone else.
    #[instrument(skip(self), fields(resource = %self.resource, acquirer = %self.options.acquirer))]
    pub async fn release(&mut self) -> CoordResult<()> {
        let result = delete_lock_row(&self.pool, &self.resource, &self.options.acquirer).await;
        // On any other failure the row may still exist; leave it to `Drop`.
        if matches!(result, Ok(()) | Err(CoordError::LockViolation { .. })) {
            self.released = true;
        }
        result
    }
}

async fn delete_lock_row<M: ConnectionManager>(
    pool: &ConnectionPool<M>,
    resource: &str,
    acquirer: &str,
) -> CoordResult<()>
where
    M::Connection: LockStore,
{
    let mut lease = pool.acquire().await?;
    let deleted = lease.connection()?.delete_lock(resource, acquirer).await?;
    if deleted == 0 {
        return Err(CoordError::LockViolation {
            resource: resource.to_string(),
            acquirer: acquirer.to_string(),
        });
    }
    debug!("lock released");
    Ok(())
}

impl<M: ConnectionManager> Drop for LockHandle<M>
where
    M::Connection: LockStore,
{
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                resource = %self.resource,
                "lock handle dropped outside a runtime; lock stays until the expiry sweep"
            );
            return;
        };

        let pool = self.pool.clone();
        let resource = std::mem::take(&mut self.resource);
        let options = Arc::clone(&self.options);
        runtime.spawn(async move {
            if let Err(e) = delete_lock_row(&pool, &resource, &options.acquirer).await {
                warn!(%resource, error = %e, "failed to release dropped lock handle");
            }
        });
    }
}

impl<M: ConnectionManager> fmt::Debug for LockHandle<M>
where
    M::Connection: LockStore,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource", &self.resource)
            .field("acquirer", &self.options.acquirer)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_acquirer_is_unique_and_tagged_with_pid() {
        let first = LockOptions::generate_acquirer();
        let second = LockOptions::generate_acquirer();
        assert_ne!(first, second);
        assert!(first.starts_with(&format!("{}:", std::process::id())));
    }

    #[test]
    fn test_empty_resource_is_rejected() {
        assert!(matches!(validate_resource(""), Err(CoordError::InvalidName(_))));
        assert!(validate_resource("report").is_ok());
    }
}
