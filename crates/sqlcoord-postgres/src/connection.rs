//! PostgreSQL connections and the statements they run.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlcoord_core::error::{CoordError, CoordResult};
use sqlcoord_core::traits::{
    ClaimedItem, ConnectionManager, LockStore, QueueStore, ServerStore, StoreConnection,
};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{ConnectOptions, Connection as _, Row};
use tracing::{debug, warn};

use crate::sql::Statements;

/// Opens PostgreSQL connections for a [`ConnectionPool`].
///
/// [`ConnectionPool`]: sqlcoord_core::pool::ConnectionPool
#[derive(Clone)]
pub struct PostgresConnectionManager {
    options: PgConnectOptions,
    statements: Arc<Statements>,
}

impl PostgresConnectionManager {
    /// Creates a manager from a connection string and schema.
    pub fn new(connection_string: &str, schema: &str) -> CoordResult<Self> {
        let options = PgConnectOptions::from_str(connection_string).map_err(|e| {
            CoordError::Configuration(format!("invalid connection string: {e}"))
        })?;
        Self::from_options(options, schema)
    }

    /// Creates a manager from prepared connect options.
    pub fn from_options(options: PgConnectOptions, schema: &str) -> CoordResult<Self> {
        Ok(Self {
            options: options.application_name("sqlcoord"),
            statements: Arc::new(Statements::new(schema)?),
        })
    }

    /// Returns the schema the tables live in.
    pub fn schema(&self) -> &str {
        self.statements.schema()
    }
}

impl ConnectionManager for PostgresConnectionManager {
    type Connection = PostgresConnection;

    async fn connect(&self) -> CoordResult<PostgresConnection> {
        let conn = self.options.connect().await.map_err(CoordError::connection)?;
        debug!(host = self.options.get_host(), "opened postgres connection");
        Ok(PostgresConnection {
            conn,
            statements: Arc::clone(&self.statements),
            broken: false,
        })
    }

    /// Pings an idle connection; a server restart or idle kill shows up here
    /// rather than in the caller's next statement.
    async fn is_valid(&self, conn: &mut PostgresConnection) -> bool {
        if conn.broken {
            return false;
        }
        match conn.conn.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "idle postgres connection failed ping");
                conn.broken = true;
                false
            }
        }
    }
}

impl fmt::Debug for PostgresConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConnectionManager")
            .field("host", &self.options.get_host())
            .field("port", &self.options.get_port())
            .field("database", &self.options.get_database())
            .field("schema", &self.statements.schema())
            .finish_non_exhaustive()
    }
}

/// A single PostgreSQL connection.
pub struct PostgresConnection {
    conn: PgConnection,
    statements: Arc<Statements>,
    broken: bool,
}

impl PostgresConnection {
    /// Maps a driver error, marking the connection broken when the error
    /// means the session is gone.
    fn check<T>(&mut self, result: Result<T, sqlx::Error>) -> CoordResult<T> {
        result.map_err(|e| {
            let (err, broken) = classify(e);
            if broken && !self.broken {
                warn!(error = %err, "postgres connection broke");
                self.broken = true;
            }
            err
        })
    }
}

/// Maps a driver error to a [`CoordError`], and reports whether the
/// connection can no longer be used.
fn classify(err: sqlx::Error) -> (CoordError, bool) {
    match err {
        sqlx::Error::Database(db) if is_serialization_failure(db.code().as_deref()) => {
            (CoordError::SerializationConflict(Box::new(sqlx::Error::Database(db))), false)
        }
        e @ (sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed) => (CoordError::connection(e), true),
        e => (CoordError::backend(e), false),
    }
}

/// `serialization_failure` and `deadlock_detected`.
fn is_serialization_failure(code: Option<&str>) -> bool {
    matches!(code, Some("40001" | "40P01"))
}

impl StoreConnection for PostgresConnection {
    fn is_open(&self) -> bool {
        !self.broken
    }
}

impl LockStore for PostgresConnection {
    async fn try_insert_lock(&mut self, resource: &str, acquirer: &str) -> CoordResult<bool> {
        let result = sqlx::query(&self.statements.insert_lock)
            .bind(resource)
            .bind(acquirer)
            .execute(&mut self.conn)
            .await;
        Ok(self.check(result)?.rows_affected() == 1)
    }

    async fn delete_lock(&mut self, resource: &str, acquirer: &str) -> CoordResult<u64> {
        let result = sqlx::query(&self.statements.delete_lock)
            .bind(resource)
            .bind(acquirer)
            .execute(&mut self.conn)
            .await;
        Ok(self.check(result)?.rows_affected())
    }

    async fn delete_expired_locks(
        &mut self,
        older_than: Duration,
        live_owners: &[String],
    ) -> CoordResult<u64> {
        let result = sqlx::query(&self.statements.delete_expired_locks)
            .bind(older_than.as_secs_f64())
            .bind(live_owners)
            .execute(&mut self.conn)
            .await;
        Ok(self.check(result)?.rows_affected())
    }
}

impl QueueStore for PostgresConnection {
    async fn insert_queue_item(&mut self, queue_name: &str, job_ref: &str) -> CoordResult<i64> {
        let result = sqlx::query_scalar::<_, i64>(&self.statements.insert_queue_item)
            .bind(job_ref)
            .bind(queue_name)
            .fetch_one(&mut self.conn)
            .await;
        self.check(result)
    }

    async fn claim_queue_item(
        &mut self,
        queue_names: &[String],
        invisibility_timeout: Duration,
    ) -> CoordResult<Option<ClaimedItem>> {
        let result = sqlx::query(&self.statements.claim_queue_item)
            .bind(queue_names)
            .bind(invisibility_timeout.as_secs_f64())
            .fetch_optional(&mut self.conn)
            .await;
        let Some(row) = self.check(result)? else {
            return Ok(None);
        };

        let item = claimed_item(&row);
        self.check(item).map(Some)
    }

    async fn delete_queue_item(&mut self, id: i64) -> CoordResult<u64> {
        let result = sqlx::query(&self.statements.delete_queue_item)
            .bind(id)
            .execute(&mut self.conn)
            .await;
        Ok(self.check(result)?.rows_affected())
    }

    async fn requeue_queue_item(&mut self, id: i64) -> CoordResult<u64> {
        let result = sqlx::query(&self.statements.requeue_queue_item)
            .bind(id)
            .execute(&mut self.conn)
            .await;
        Ok(self.check(result)?.rows_affected())
    }
}

fn claimed_item(row: &PgRow) -> Result<ClaimedItem, sqlx::Error> {
    Ok(ClaimedItem {
        id: row.try_get("id")?,
        job_ref: row.try_get("job_ref")?,
        queue_name: row.try_get("queue_name")?,
    })
}

impl ServerStore for PostgresConnection {
    async fn upsert_server(&mut self, server_id: &str) -> CoordResult<()> {
        let result = sqlx::query(&self.statements.upsert_server)
            .bind(server_id)
            .execute(&mut self.conn)
            .await;
        self.check(result).map(|_| ())
    }

    async fn delete_server(&mut self, server_id: &str) -> CoordResult<u64> {
        let result = sqlx::query(&self.statements.delete_server)
            .bind(server_id)
            .execute(&mut self.conn)
            .await;
        Ok(self.check(result)?.rows_affected())
    }

    async fn delete_timed_out_servers(&mut self, timeout: Duration) -> CoordResult<u64> {
        let result = sqlx::query(&self.statements.delete_timed_out_servers)
            .bind(timeout.as_secs_f64())
            .execute(&mut self.conn)
            .await;
        Ok(self.check(result)?.rows_affected())
    }

    async fn live_servers(&mut self, timeout: Duration) -> CoordResult<Vec<String>> {
        let result = sqlx::query_scalar::<_, String>(&self.statements.live_servers)
            .bind(timeout.as_secs_f64())
            .fetch_all(&mut self.conn)
            .await;
        self.check(result)
    }
}

impl fmt::Debug for PostgresConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConnection")
            .field("schema", &self.statements.schema())
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}
