//! Traits a store backend implements.
//!
//! A backend provides a [`ConnectionManager`] that opens connections, and a
//! connection type exposing one method per statement the coordination
//! services need. The services in this crate own all retry, backoff and
//! cancellation logic; a statement method performs exactly one round-trip
//! and reports what the store did.

use std::future::Future;
use std::time::Duration;

use crate::error::CoordResult;

// ============================================================================
// Connections
// ============================================================================

/// Opens new store connections on behalf of a [`ConnectionPool`].
///
/// [`ConnectionPool`]: crate::pool::ConnectionPool
pub trait ConnectionManager: Send + Sync + 'static {
    /// The connection type produced by this manager.
    type Connection: StoreConnection;

    /// Opens a new connection.
    ///
    /// Failures are returned to the caller of `acquire` as-is; the pool does
    /// not retry them.
    fn connect(&self) -> impl Future<Output = CoordResult<Self::Connection>> + Send;

    /// Checks an idle connection before the pool hands it out again.
    ///
    /// Returning `false` makes the pool destroy the connection and open a
    /// fresh one in its place. The default only consults
    /// [`StoreConnection::is_open`]; backends whose sessions can die silently
    /// while idle should round-trip to the store.
    fn is_valid(&self, conn: &mut Self::Connection) -> impl Future<Output = bool> + Send {
        std::future::ready(conn.is_open())
    }
}

/// A single live connection to the store.
pub trait StoreConnection: Send + 'static {
    /// Returns false once the driver has observed the connection break.
    ///
    /// The pool discards connections that are no longer open instead of
    /// handing them out again.
    fn is_open(&self) -> bool;
}

// ============================================================================
// Lock statements
// ============================================================================

/// Statements against the lock table.
pub trait LockStore: StoreConnection {
    /// Inserts a lock row unless one already exists for `resource`.
    ///
    /// Returns `true` when the row was inserted, stamped with the store's
    /// current time.
    fn try_insert_lock(
        &mut self,
        resource: &str,
        acquirer: &str,
    ) -> impl Future<Output = CoordResult<bool>> + Send;

    /// Deletes the lock row owned by `acquirer`, returning rows affected.
    fn delete_lock(
        &mut self,
        resource: &str,
        acquirer: &str,
    ) -> impl Future<Output = CoordResult<u64>> + Send;

    /// Deletes lock rows acquired more than `older_than` ago whose acquirer
    /// is not in `live_owners`. Returns rows affected.
    fn delete_expired_locks(
        &mut self,
        older_than: Duration,
        live_owners: &[String],
    ) -> impl Future<Output = CoordResult<u64>> + Send;
}

// ============================================================================
// Queue statements
// ============================================================================

/// A queue row claimed by [`QueueStore::claim_queue_item`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedItem {
    /// Row identifier.
    pub id: i64,
    /// Opaque reference to the job.
    pub job_ref: String,
    /// Queue the row belongs to.
    pub queue_name: String,
}

/// Statements against the queue item table.
pub trait QueueStore: StoreConnection {
    /// Inserts an unclaimed item and returns its id.
    fn insert_queue_item(
        &mut self,
        queue_name: &str,
        job_ref: &str,
    ) -> impl Future<Output = CoordResult<i64>> + Send;

    /// Atomically claims the next eligible item.
    ///
    /// Eligible rows belong to one of `queue_names` and are either unclaimed
    /// or were claimed more than `invisibility_timeout` ago. Rows are ordered
    /// by the position of their queue in `queue_names`, then by id. Rows
    /// locked by another in-flight claim are skipped.
    ///
    /// A concurrent-update rejection is reported as
    /// [`CoordError::SerializationConflict`](crate::CoordError::SerializationConflict).
    fn claim_queue_item(
        &mut self,
        queue_names: &[String],
        invisibility_timeout: Duration,
    ) -> impl Future<Output = CoordResult<Option<ClaimedItem>>> + Send;

    /// Deletes an item, returning rows affected.
    fn delete_queue_item(&mut self, id: i64) -> impl Future<Output = CoordResult<u64>> + Send;

    /// Clears the claim on an item, returning rows affected.
    fn requeue_queue_item(&mut self, id: i64) -> impl Future<Output = CoordResult<u64>> + Send;
}

// ============================================================================
// Server statements
// ============================================================================

/// Statements against the server (liveness) table.
pub trait ServerStore: StoreConnection {
    /// Inserts or refreshes a server row with the store's current time.
    fn upsert_server(&mut self, server_id: &str) -> impl Future<Output = CoordResult<()>> + Send;

    /// Deletes a server row, returning rows affected.
    fn delete_server(&mut self, server_id: &str) -> impl Future<Output = CoordResult<u64>> + Send;

    /// Deletes servers whose last heartbeat is older than `timeout`.
    fn delete_timed_out_servers(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = CoordResult<u64>> + Send;

    /// Returns ids of servers that heartbeated within `timeout`.
    fn live_servers(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = CoordResult<Vec<String>>> + Send;
}

// ============================================================================
// Liveness
// ============================================================================

/// Answers which lock owners are currently alive.
///
/// Consulted by the lock expiry sweep; locks held by a live owner are never
/// reclaimed, however old.
pub trait LivenessRegistry: Send + Sync {
    /// Returns the identities of all live owners.
    fn live_owners(&self) -> impl Future<Output = CoordResult<Vec<String>>> + Send;
}
