//! Liveness registry backed by the server table.
//!
//! Each process announces its acquirer identity and refreshes it on a
//! heartbeat. The lock expiry sweep treats every identity with a recent
//! heartbeat as alive and never reclaims its locks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::cancel::{self, CancelToken};
use crate::error::{CoordError, CoordResult};
use crate::pool::ConnectionPool;
use crate::traits::{ConnectionManager, LivenessRegistry, ServerStore};

/// Configuration for a [`ServerRegistry`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Cadence of heartbeats sent by [`ServerRegistry::spawn_heartbeat`].
    pub heartbeat_interval: Duration,
    /// A server whose last heartbeat is older than this is considered dead.
    pub server_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            server_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Tracks live servers in the store.
pub struct ServerRegistry<M: ConnectionManager>
where
    M::Connection: ServerStore,
{
    pool: ConnectionPool<M>,
    options: Arc<ServerOptions>,
}

impl<M: ConnectionManager> ServerRegistry<M>
where
    M::Connection: ServerStore,
{
    /// Creates a registry that runs its statements through `pool`.
    pub fn new(pool: ConnectionPool<M>, options: ServerOptions) -> CoordResult<Self> {
        if options.heartbeat_interval >= options.server_timeout {
            return Err(CoordError::Configuration(
                "heartbeat_interval must be shorter than server_timeout".to_string(),
            ));
        }
        Ok(Self {
            pool,
            options: Arc::new(options),
        })
    }

    /// Registers `server_id` as alive.
    #[instrument(skip(self))]
    pub async fn announce(&self, server_id: &str) -> CoordResult<()> {
        if server_id.is_empty() {
            return Err(CoordError::InvalidName(
                "server id cannot be empty".to_string(),
            ));
        }
        self.heartbeat(server_id).await?;
        info!("server announced");
        Ok(())
    }

    /// Refreshes the heartbeat of `server_id`, registering it if missing.
    pub async fn heartbeat(&self, server_id: &str) -> CoordResult<()> {
        let mut conn = self.pool.acquire().await?;
        conn.connection()?.upsert_server(server_id).await
    }

    /// Removes `server_id` from the registry.
    #[instrument(skip(self))]
    pub async fn remove(&self, server_id: &str) -> CoordResult<()> {
        let mut conn = self.pool.acquire().await?;
        let removed = conn.connection()?.delete_server(server_id).await?;
        debug!(removed, "server removed");
        Ok(())
    }

    /// Deletes servers that stopped heartbeating. Returns how many.
    pub async fn remove_timed_out(&self) -> CoordResult<u64> {
        let mut conn = self.pool.acquire().await?;
        let removed = conn
            .connection()?
            .delete_timed_out_servers(self.options.server_timeout)
            .await?;
        if removed > 0 {
            info!(removed, "removed timed out servers");
        }
        Ok(removed)
    }

    /// Returns the ids of servers with a recent heartbeat.
    pub async fn live_servers(&self) -> CoordResult<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        conn.connection()?
            .live_servers(self.options.server_timeout)
            .await
    }

    /// Announces `server_id` and keeps it alive until `cancel` fires, then
    /// removes it.
    ///
    /// Failed heartbeats are logged and retried on the next tick.
    pub fn spawn_heartbeat(&self, server_id: String, cancel: CancelToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            if let Err(e) = registry.announce(&server_id).await {
                warn!(%server_id, error = %e, "failed to announce server");
            }
            while cancel::sleep(registry.options.heartbeat_interval, &cancel)
                .await
                .is_ok()
            {
                if let Err(e) = registry.heartbeat(&server_id).await {
                    warn!(%server_id, error = %e, "server heartbeat failed");
                }
            }
            if let Err(e) = registry.remove(&server_id).await {
                warn!(%server_id, error = %e, "failed to remove server on shutdown");
            }
        })
    }
}

impl<M: ConnectionManager> LivenessRegistry for ServerRegistry<M>
where
    M::Connection: ServerStore,
{
    async fn live_owners(&self) -> CoordResult<Vec<String>> {
        self.live_servers().await
    }
}

impl<M: ConnectionManager> Clone for ServerRegistry<M>
where
    M::Connection: ServerStore,
{
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            options: Arc::clone(&self.options),
        }
    }
}

impl<M: ConnectionManager> fmt::Debug for ServerRegistry<M>
where
    M::Connection: ServerStore,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("options", &self.options)
            .finish()
    }
}
