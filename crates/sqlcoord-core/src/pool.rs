//! Bounded pool of store connections.
//!
//! The pool owns every live connection. Callers borrow one through a
//! [`PooledConnection`] lease that hands it back on [`release`] or drop.
//! The live count is only ever changed through compare-and-swap, so the
//! pool can neither leak a slot nor exceed `max_size`.
//!
//! [`release`]: PooledConnection::release

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, instrument, warn};

use crate::backoff::Backoff;
use crate::cancel::{self, CancelToken};
use crate::error::{CoordError, CoordResult};
use crate::traits::{ConnectionManager, StoreConnection};

/// Configuration for a [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Maximum number of live connections.
    pub max_size: usize,
    /// First wait when the pool is saturated.
    pub min_backoff: Duration,
    /// Longest wait between saturation retries.
    pub max_backoff: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(100),
        }
    }
}

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections currently counted against `max_size`, leased or idle.
    pub live: usize,
    /// Connections waiting in the free set.
    pub idle: usize,
    /// Configured bound.
    pub max_size: usize,
}

/// A bounded pool of connections opened by a [`ConnectionManager`].
///
/// Cloning the pool is cheap; clones share the same connections.
pub struct ConnectionPool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

struct PoolInner<M: ConnectionManager> {
    manager: M,
    options: PoolOptions,
    /// Free set. Never locked across an await.
    idle: Mutex<Vec<M::Connection>>,
    live: AtomicUsize,
    closed: AtomicBool,
    returned: Notify,
}

impl<M: ConnectionManager> PoolInner<M> {
    /// Pops an open connection, discarding any that broke while idle.
    fn pop_idle(&self) -> Option<M::Connection> {
        loop {
            let conn = self.idle.lock().pop()?;
            if conn.is_open() {
                return Some(conn);
            }
            drop(conn);
            self.forget(1);
            debug!("discarded idle connection that is no longer open");
        }
    }

    /// Claims a slot for a new connection if the pool is below its bound.
    fn try_reserve(&self) -> bool {
        let max = self.options.max_size;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < max).then_some(live + 1)
            })
            .is_ok()
    }

    /// Gives `count` slots back and wakes a waiter.
    fn forget(&self, count: usize) {
        let _ = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                Some(live.saturating_sub(count))
            });
        self.returned.notify_one();
    }

    fn put_back(&self, conn: M::Connection) {
        {
            let mut idle = self.idle.lock();
            if !self.closed.load(Ordering::Acquire) && conn.is_open() {
                idle.push(conn);
                drop(idle);
                self.returned.notify_one();
                return;
            }
        }
        drop(conn);
        self.forget(1);
    }
}

/// Returns a reserved slot unless the connection was opened successfully.
struct Reservation<'a, M: ConnectionManager> {
    inner: &'a PoolInner<M>,
    armed: bool,
}

impl<M: ConnectionManager> Drop for Reservation<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.forget(1);
        }
    }
}

impl<M: ConnectionManager> ConnectionPool<M> {
    /// Creates an empty pool. Connections are opened lazily.
    pub fn new(manager: M, options: PoolOptions) -> CoordResult<Self> {
        if options.max_size == 0 {
            return Err(CoordError::Configuration(
                "pool max_size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                manager,
                options,
                idle: Mutex::new(Vec::new()),
                live: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                returned: Notify::new(),
            }),
        })
    }

    /// Returns the connection manager.
    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Returns the pool configuration.
    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Leases a connection, waiting while the pool is saturated.
    pub async fn acquire(&self) -> CoordResult<PooledConnection<M>> {
        self.acquire_with_cancel(&cancel::never()).await
    }

    /// Leases a connection, giving up with [`CoordError::Cancelled`] once
    /// `cancel` fires.
    ///
    /// A connection that fails to open is reported immediately and its slot
    /// is returned to the pool.
    #[instrument(skip_all, level = "debug", fields(max_size = self.inner.options.max_size))]
    pub async fn acquire_with_cancel(
        &self,
        cancel: &CancelToken,
    ) -> CoordResult<PooledConnection<M>> {
        let inner = &self.inner;
        let mut backoff = Backoff::new(inner.options.min_backoff, inner.options.max_backoff);

        loop {
            cancel::check(cancel)?;
            if inner.closed.load(Ordering::Acquire) {
                return Err(CoordError::PoolClosed);
            }

            if let Some(mut conn) = inner.pop_idle() {
                // The popped connection still holds a slot until it passes.
                let mut reservation = Reservation {
                    inner: inner.as_ref(),
                    armed: true,
                };
                let valid = tokio::select! {
                    valid = inner.manager.is_valid(&mut conn) => valid,
                    _ = cancel::cancelled(cancel) => return Err(CoordError::Cancelled),
                };
                if valid {
                    reservation.armed = false;
                    return Ok(PooledConnection::new(conn, Arc::clone(inner)));
                }
                drop(conn);
                debug!("discarded idle connection that failed validation");
                continue;
            }

            if inner.try_reserve() {
                let mut reservation = Reservation {
                    inner: inner.as_ref(),
                    armed: true,
                };
                let conn = tokio::select! {
                    conn = inner.manager.connect() => conn?,
                    _ = cancel::cancelled(cancel) => return Err(CoordError::Cancelled),
                };
                reservation.armed = false;
                debug!(
                    live = inner.live.load(Ordering::Relaxed),
                    "opened new store connection"
                );
                return Ok(PooledConnection::new(conn, Arc::clone(inner)));
            }

            tokio::select! {
                _ = inner.returned.notified() => {}
                _ = tokio::time::sleep(backoff.next_delay()) => {}
                _ = cancel::cancelled(cancel) => return Err(CoordError::Cancelled),
            }
        }
    }

    /// Returns a leased connection to the pool. Releasing twice is a no-op.
    pub fn release(&self, lease: &mut PooledConnection<M>) {
        lease.release();
    }

    /// Returns current occupancy.
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            live: self.inner.live.load(Ordering::Acquire),
            idle: self.inner.idle.lock().len(),
            max_size: self.inner.options.max_size,
        }
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Closes the pool and destroys every idle connection.
    ///
    /// Leases still outstanding are destroyed when they are released.
    pub fn close(&self) {
        let drained = {
            let mut idle = self.inner.idle.lock();
            self.inner.closed.store(true, Ordering::Release);
            std::mem::take(&mut *idle)
        };
        let count = drained.len();
        drop(drained);
        self.inner.forget(count);
        self.inner.returned.notify_waiters();

        let outstanding = self.inner.live.load(Ordering::Acquire);
        if outstanding > 0 {
            warn!(outstanding, "connection pool closed while leases are outstanding");
        }
        debug!(destroyed = count, "connection pool closed");
    }
}

impl<M: ConnectionManager> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ConnectionManager> fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A connection leased from a [`ConnectionPool`].
///
/// Dropping the lease returns the connection. After [`release`](Self::release)
/// every access fails with [`CoordError::LeaseReleased`].
pub struct PooledConnection<M: ConnectionManager> {
    conn: Option<M::Connection>,
    pool: Arc<PoolInner<M>>,
}

impl<M: ConnectionManager> PooledConnection<M> {
    fn new(conn: M::Connection, pool: Arc<PoolInner<M>>) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }

    /// Borrows the underlying connection.
    pub fn connection(&mut self) -> CoordResult<&mut M::Connection> {
        self.conn.as_mut().ok_or(CoordError::LeaseReleased)
    }

    /// Returns true once the connection has been handed back.
    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    /// Hands the connection back to the pool. Idempotent.
    pub fn release(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<M: ConnectionManager> fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("released", &self.is_released())
            .finish()
    }
}
