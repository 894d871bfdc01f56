//! PostgreSQL store builder.

use std::env;
use std::fmt;

use sqlcoord_core::error::{CoordError, CoordResult};
use sqlcoord_core::lock::{LockOptions, LockService};
use sqlcoord_core::pool::{ConnectionPool, PoolOptions};
use sqlcoord_core::queue::{QueueOptions, WorkQueue};
use sqlcoord_core::server::{ServerOptions, ServerRegistry};
use tracing::info;

use crate::connection::PostgresConnectionManager;
use crate::sql::DEFAULT_SCHEMA;

/// Lock service over PostgreSQL.
pub type PostgresLockService = LockService<PostgresConnectionManager>;
/// Work queue over PostgreSQL.
pub type PostgresWorkQueue = WorkQueue<PostgresConnectionManager>;
/// Server registry over PostgreSQL.
pub type PostgresServerRegistry = ServerRegistry<PostgresConnectionManager>;

/// Builder for [`PostgresStore`] configuration.
pub struct PostgresStoreBuilder {
    connection_string: Option<String>,
    schema: String,
    pool_options: PoolOptions,
    lock_options: LockOptions,
    queue_options: QueueOptions,
    server_options: ServerOptions,
}

impl PostgresStoreBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self {
            connection_string: None,
            schema: DEFAULT_SCHEMA.to_string(),
            pool_options: PoolOptions::default(),
            lock_options: LockOptions::default(),
            queue_options: QueueOptions::default(),
            server_options: ServerOptions::default(),
        }
    }

    /// Creates a builder configured from the environment.
    ///
    /// Reads `SQLCOORD_DATABASE_URL` (or `DATABASE_URL`), `SQLCOORD_SCHEMA`
    /// and `SQLCOORD_MAX_CONNECTIONS`. Only the connection string is required.
    pub fn from_env() -> CoordResult<Self> {
        let connection_string = env::var("SQLCOORD_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .map_err(|_| {
                CoordError::Configuration(
                    "SQLCOORD_DATABASE_URL or DATABASE_URL must be set".to_string(),
                )
            })?;

        let mut builder = Self::new().connection_string(connection_string);
        if let Ok(schema) = env::var("SQLCOORD_SCHEMA") {
            builder = builder.schema(schema);
        }
        if let Ok(max) = env::var("SQLCOORD_MAX_CONNECTIONS") {
            let max = max.parse::<usize>().map_err(|e| {
                CoordError::Configuration(format!("invalid SQLCOORD_MAX_CONNECTIONS '{max}': {e}"))
            })?;
            builder = builder.max_connections(max);
        }
        Ok(builder)
    }

    /// Sets the PostgreSQL connection string.
    pub fn connection_string(mut self, conn_str: impl Into<String>) -> Self {
        self.connection_string = Some(conn_str.into());
        self
    }

    /// Sets the schema holding the tables.
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Sets the maximum number of live connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.pool_options.max_size = max;
        self
    }

    /// Sets the pool options.
    pub fn pool_options(mut self, options: PoolOptions) -> Self {
        self.pool_options = options;
        self
    }

    /// Sets the options used by [`PostgresStore::lock_service`].
    pub fn lock_options(mut self, options: LockOptions) -> Self {
        self.lock_options = options;
        self
    }

    /// Sets the options used by [`PostgresStore::work_queue`].
    pub fn queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }

    /// Sets the options used by [`PostgresStore::server_registry`].
    pub fn server_options(mut self, options: ServerOptions) -> Self {
        self.server_options = options;
        self
    }

    /// Builds the store and checks that a connection can be opened.
    pub async fn build(self) -> CoordResult<PostgresStore> {
        let store = self.build_lazy()?;
        // Open one connection up front so a bad URL fails here, not on first use.
        store.pool.acquire().await?;
        info!(schema = %store.pool.manager().schema(), "postgres store ready");
        Ok(store)
    }

    /// Builds the store without connecting.
    pub fn build_lazy(self) -> CoordResult<PostgresStore> {
        let connection_string = self.connection_string.ok_or_else(|| {
            CoordError::Configuration("connection string not specified".to_string())
        })?;
        let manager = PostgresConnectionManager::new(&connection_string, &self.schema)?;
        let pool = ConnectionPool::new(manager, self.pool_options)?;

        Ok(PostgresStore {
            pool,
            lock_options: self.lock_options,
            queue_options: self.queue_options,
            server_options: self.server_options,
        })
    }
}

impl Default for PostgresStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PostgresStoreBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStoreBuilder")
            .field(
                "connection_string",
                &self.connection_string.as_ref().map(|_| "<redacted>"),
            )
            .field("schema", &self.schema)
            .field("pool_options", &self.pool_options)
            .field("lock_options", &self.lock_options)
            .field("queue_options", &self.queue_options)
            .field("server_options", &self.server_options)
            .finish()
    }
}

/// A PostgreSQL store shared by the lock service, work queue and server
/// registry it hands out.
///
/// All services created from one store draw from the same connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: ConnectionPool<PostgresConnectionManager>,
    lock_options: LockOptions,
    queue_options: QueueOptions,
    server_options: ServerOptions,
}

impl PostgresStore {
    /// Returns a new builder for configuring the store.
    pub fn builder() -> PostgresStoreBuilder {
        PostgresStoreBuilder::new()
    }

    /// Creates a store using the specified connection string.
    pub async fn new(connection_string: impl Into<String>) -> CoordResult<Self> {
        Self::builder()
            .connection_string(connection_string)
            .build()
            .await
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> &ConnectionPool<PostgresConnectionManager> {
        &self.pool
    }

    /// Creates a lock service. Services created by one store share an
    /// acquirer identity.
    pub fn lock_service(&self) -> CoordResult<PostgresLockService> {
        LockService::new(self.pool.clone(), self.lock_options.clone())
    }

    /// Creates a work queue.
    pub fn work_queue(&self) -> CoordResult<PostgresWorkQueue> {
        WorkQueue::new(self.pool.clone(), self.queue_options.clone())
    }

    /// Creates a server registry.
    pub fn server_registry(&self) -> CoordResult<PostgresServerRegistry> {
        ServerRegistry::new(self.pool.clone(), self.server_options.clone())
    }

    /// Closes the pool. Outstanding services fail with `PoolClosed`.
    pub fn close(&self) {
        self.pool.close();
    }
}
