//! Connections to the in-memory store.

use std::time::Duration;

use parking_lot::MutexGuard;
use sqlcoord_core::error::{CoordError, CoordResult};
use sqlcoord_core::traits::{
    ClaimedItem, ConnectionManager, LockStore, QueueStore, ServerStore, StoreConnection,
};
use tracing::trace;

use crate::state::{ItemRow, LockRow, MemoryState};
use crate::store::MemoryStore;

/// Opens [`MemoryConnection`]s to a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryConnectionManager {
    store: MemoryStore,
}

impl MemoryConnectionManager {
    pub(crate) fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    /// Returns the store this manager connects to.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

impl ConnectionManager for MemoryConnectionManager {
    type Connection = MemoryConnection;

    async fn connect(&self) -> CoordResult<MemoryConnection> {
        let mut state = self.store.lock_state();
        if state.refuse_connections {
            return Err(CoordError::connection(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "memory store is refusing connections",
            )));
        }
        state.connections_opened += 1;
        trace!(opened = state.connections_opened, "memory connection opened");
        Ok(MemoryConnection {
            store: self.store.clone(),
            generation: state.generation,
        })
    }
}

/// A connection to a [`MemoryStore`].
///
/// Closed once [`MemoryStore::disconnect_all`] is called; statements on a
/// closed connection fail with [`CoordError::Connection`].
#[derive(Debug)]
pub struct MemoryConnection {
    store: MemoryStore,
    generation: u64,
}

impl MemoryConnection {
    fn state(&self) -> CoordResult<MutexGuard<'_, MemoryState>> {
        let mut state = self.store.lock_state();
        if state.generation != self.generation {
            return Err(CoordError::connection(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "memory connection was reset",
            )));
        }
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(CoordError::backend("statement failed"));
        }
        Ok(state)
    }
}

/// Whether a heartbeat of age `age` still counts as live.
fn heartbeat_within(age: Duration, timeout: Duration) -> bool {
    age <= timeout
}

impl StoreConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.store.lock_state().generation == self.generation
    }
}

impl LockStore for MemoryConnection {
    async fn try_insert_lock(&mut self, resource: &str, acquirer: &str) -> CoordResult<bool> {
        let mut state = self.state()?;
        if state.locks.contains_key(resource) {
            return Ok(false);
        }
        let acquired = state.now();
        state.locks.insert(
            resource.to_string(),
            LockRow {
                acquired,
                acquirer: acquirer.to_string(),
            },
        );
        Ok(true)
    }

    async fn delete_lock(&mut self, resource: &str, acquirer: &str) -> CoordResult<u64> {
        let mut state = self.state()?;
        match state.locks.get(resource) {
            Some(row) if row.acquirer == acquirer => {
                state.locks.remove(resource);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn delete_expired_locks(
        &mut self,
        older_than: Duration,
        live_owners: &[String],
    ) -> CoordResult<u64> {
        let mut state = self.state()?;
        let now = state.now();
        let before = state.locks.len();
        state.locks.retain(|_, row| {
            let expired = now.saturating_duration_since(row.acquired) > older_than;
            !expired || live_owners.contains(&row.acquirer)
        });
        Ok((before - state.locks.len()) as u64)
    }
}

impl QueueStore for MemoryConnection {
    async fn insert_queue_item(&mut self, queue_name: &str, job_ref: &str) -> CoordResult<i64> {
        let mut state = self.state()?;
        state.next_item_id += 1;
        let id = state.next_item_id;
        state.items.insert(
            id,
            ItemRow {
                job_ref: job_ref.to_string(),
                queue_name: queue_name.to_string(),
                claimed_at: None,
            },
        );
        Ok(id)
    }

    async fn claim_queue_item(
        &mut self,
        queue_names: &[String],
        invisibility_timeout: Duration,
    ) -> CoordResult<Option<ClaimedItem>> {
        let mut state = self.state()?;
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(CoordError::SerializationConflict(
                "could not serialize access due to concurrent update".into(),
            ));
        }

        let now = state.now();
        let eligible = |row: &ItemRow| match row.claimed_at {
            None => true,
            Some(at) => now.saturating_duration_since(at) > invisibility_timeout,
        };

        for queue_name in queue_names {
            let found = state
                .items
                .iter()
                .find(|(_, row)| &row.queue_name == queue_name && eligible(row))
                .map(|(id, _)| *id);

            if let Some(id) = found
                && let Some(row) = state.items.get_mut(&id)
            {
                row.claimed_at = Some(now);
                return Ok(Some(ClaimedItem {
                    id,
                    job_ref: row.job_ref.clone(),
                    queue_name: row.queue_name.clone(),
                }));
            }
        }
        Ok(None)
    }

    async fn delete_queue_item(&mut self, id: i64) -> CoordResult<u64> {
        let mut state = self.state()?;
        Ok(u64::from(state.items.remove(&id).is_some()))
    }

    async fn requeue_queue_item(&mut self, id: i64) -> CoordResult<u64> {
        let mut state = self.state()?;
        match state.items.get_mut(&id) {
            Some(row) => {
                row.claimed_at = None;
                Ok(1)
            }
            None => Ok(0),
        }
    }
}

impl ServerStore for MemoryConnection {
    async fn upsert_server(&mut self, server_id: &str) -> CoordResult<()> {
        let mut state = self.state()?;
        let now = state.now();
        state.servers.insert(server_id.to_string(), now);
        Ok(())
    }

    async fn delete_server(&mut self, server_id: &str) -> CoordResult<u64> {
        let mut state = self.state()?;
        Ok(u64::from(state.servers.remove(server_id).is_some()))
    }

    async fn delete_timed_out_servers(&mut self, timeout: Duration) -> CoordResult<u64> {
        let mut state = self.state()?;
        let now = state.now();
        let before = state.servers.len();
        state.servers.retain(|_, heartbeat| {
            heartbeat_within(now.saturating_duration_since(*heartbeat), timeout)
        });
        Ok((before - state.servers.len()) as u64)
    }

    async fn live_servers(&mut self, timeout: Duration) -> CoordResult<Vec<String>> {
        let state = self.state()?;
        let mut live: Vec<String> = state
            .servers
            .iter()
            .filter(|(_, heartbeat)| heartbeat_within(state.age(**heartbeat), timeout))
            .map(|(id, _)| id.clone())
            .collect();
        live.sort();
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(store: &MemoryStore) -> MemoryConnection {
        store.connection_manager().connect().await.unwrap()
    }

    #[tokio::test]
    async fn test_lock_row_is_unique_per_resource() {
        let store = MemoryStore::new();
        let mut conn = connect(&store).await;

        assert!(conn.try_insert_lock("report", "a").await.unwrap());
        assert!(!conn.try_insert_lock("report", "b").await.unwrap());
        assert_eq!(conn.delete_lock("report", "b").await.unwrap(), 0);
        assert_eq!(conn.delete_lock("report", "a").await.unwrap(), 1);
        assert_eq!(store.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_claim_orders_by_queue_list_then_id() {
        let store = MemoryStore::new();
        let mut conn = connect(&store).await;
        let low_first = conn.insert_queue_item("low", "l1").await.unwrap();
        let high_first = conn.insert_queue_item("high", "h1").await.unwrap();
        conn.insert_queue_item("high", "h2").await.unwrap();

        let queues = vec!["high".to_string(), "low".to_string()];
        let timeout = Duration::from_secs(60);
        let first = conn.claim_queue_item(&queues, timeout).await.unwrap().unwrap();
        let second = conn.claim_queue_item(&queues, timeout).await.unwrap().unwrap();
        let third = conn.claim_queue_item(&queues, timeout).await.unwrap().unwrap();

        assert_eq!(first.id, high_first);
        assert_eq!(second.job_ref, "h2");
        assert_eq!(third.id, low_first);
        assert!(conn.claim_queue_item(&queues, timeout).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_reclaims_after_invisibility_timeout() {
        let store = MemoryStore::new();
        let mut conn = connect(&store).await;
        let id = conn.insert_queue_item("default", "job").await.unwrap();
        let queues = vec!["default".to_string()];
        let timeout = Duration::from_secs(30);

        assert!(conn.claim_queue_item(&queues, timeout).await.unwrap().is_some());
        assert!(conn.claim_queue_item(&queues, timeout).await.unwrap().is_none());

        store.advance_clock(Duration::from_secs(31));
        let reclaimed = conn.claim_queue_item(&queues, timeout).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, id);
    }

    #[tokio::test]
    async fn test_expired_locks_of_live_owners_survive() {
        let store = MemoryStore::new();
        let mut conn = connect(&store).await;
        conn.try_insert_lock("dead", "crashed").await.unwrap();
        conn.try_insert_lock("slow", "alive").await.unwrap();
        conn.try_insert_lock("fresh", "crashed").await.unwrap();
        store.advance_clock(Duration::from_secs(120));
        conn.try_insert_lock("young", "crashed").await.unwrap();

        let removed = conn
            .delete_expired_locks(Duration::from_secs(60), &["alive".to_string()])
            .await
            .unwrap();

        assert_eq!(removed, 2);
        assert_eq!(store.lock_owner("slow").as_deref(), Some("alive"));
        assert_eq!(store.lock_owner("young").as_deref(), Some("crashed"));
        assert!(store.lock_owner("dead").is_none());
    }

    #[tokio::test]
    async fn test_disconnect_closes_existing_connections() {
        let store = MemoryStore::new();
        let mut conn = connect(&store).await;
        assert!(conn.is_open());

        store.disconnect_all();
        assert!(!conn.is_open());
        assert!(matches!(
            conn.insert_queue_item("default", "job").await,
            Err(CoordError::Connection(_))
        ));
        assert!(connect(&store).await.is_open());
    }

    #[test]
    fn test_heartbeat_exactly_at_timeout_is_live() {
        let timeout = Duration::from_secs(60);
        assert!(heartbeat_within(timeout, timeout));
        assert!(!heartbeat_within(timeout + Duration::from_nanos(1), timeout));
    }

    #[tokio::test]
    async fn test_injected_statement_failure_is_a_backend_error() {
        let store = MemoryStore::new();
        let mut conn = connect(&store).await;
        store.inject_statement_failures(1);

        assert!(matches!(
            conn.try_insert_lock("report", "a").await,
            Err(CoordError::Backend(_))
        ));
        assert!(conn.is_open());
        assert!(conn.try_insert_lock("report", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_conflict_is_reported_once() {
        let store = MemoryStore::new();
        let mut conn = connect(&store).await;
        conn.insert_queue_item("default", "job").await.unwrap();
        store.inject_serialization_conflicts(1);

        let queues = vec!["default".to_string()];
        let timeout = Duration::from_secs(30);
        assert!(matches!(
            conn.claim_queue_item(&queues, timeout).await,
            Err(CoordError::SerializationConflict(_))
        ));
        assert!(conn.claim_queue_item(&queues, timeout).await.unwrap().is_some());
    }
}
