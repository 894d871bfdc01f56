//! Shared handle to the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use sqlcoord_core::error::CoordResult;
use sqlcoord_core::pool::{ConnectionPool, PoolOptions};

use crate::connection::MemoryConnectionManager;
use crate::state::MemoryState;

/// Snapshot of one queue item row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItemRecord {
    /// Row identifier.
    pub id: i64,
    /// Opaque job reference.
    pub job_ref: String,
    /// Queue the item belongs to.
    pub queue_name: String,
    /// Whether a consumer currently holds a claim.
    pub claimed: bool,
}

/// A store living entirely in this process.
///
/// Every clone refers to the same tables, so it stands in for a database
/// that many pools and services share. Besides the tables it offers test
/// hooks to move the store clock, break connections, refuse new ones and
/// inject statement failures or serialization conflicts.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock()
    }

    /// Returns a connection manager opening connections to this store.
    pub fn connection_manager(&self) -> MemoryConnectionManager {
        MemoryConnectionManager::new(self.clone())
    }

    /// Creates a connection pool over this store.
    pub fn pool(&self, options: PoolOptions) -> CoordResult<ConnectionPool<MemoryConnectionManager>> {
        ConnectionPool::new(self.connection_manager(), options)
    }

    /// Moves the store clock forward.
    pub fn advance_clock(&self, by: Duration) {
        self.state.lock().clock_offset += by;
    }

    /// Breaks every connection opened so far.
    pub fn disconnect_all(&self) {
        self.state.lock().generation += 1;
    }

    /// Makes new connection attempts fail (or succeed again).
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Makes the next `count` claim statements fail with a serialization conflict.
    pub fn inject_serialization_conflicts(&self, count: u32) {
        self.state.lock().pending_conflicts += count;
    }

    /// Makes the next `count` statements, of any kind, fail with a backend error.
    ///
    /// The connections stay open.
    pub fn inject_statement_failures(&self, count: u32) {
        self.state.lock().pending_failures += count;
    }

    /// Number of connections opened so far.
    pub fn connections_opened(&self) -> u64 {
        self.state.lock().connections_opened
    }

    /// Returns the acquirer holding `resource`, if any.
    pub fn lock_owner(&self, resource: &str) -> Option<String> {
        self.state
            .lock()
            .locks
            .get(resource)
            .map(|row| row.acquirer.clone())
    }

    /// Number of lock rows.
    pub fn lock_count(&self) -> usize {
        self.state.lock().locks.len()
    }

    /// Returns a snapshot of the queue item `id`.
    pub fn queue_item(&self, id: i64) -> Option<QueueItemRecord> {
        self.state.lock().items.get(&id).map(|row| QueueItemRecord {
            id,
            job_ref: row.job_ref.clone(),
            queue_name: row.queue_name.clone(),
            claimed: row.claimed_at.is_some(),
        })
    }

    /// Number of queue item rows across all queues.
    pub fn item_count(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Time since `server_id` last heartbeated, by the store clock.
    pub fn heartbeat_age(&self, server_id: &str) -> Option<Duration> {
        let state = self.state.lock();
        state.servers.get(server_id).map(|at| state.age(*at))
    }

    /// Ids of registered servers, sorted.
    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().servers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryStore")
            .field("locks", &state.locks.len())
            .field("items", &state.items.len())
            .field("servers", &state.servers.len())
            .finish()
    }
}
