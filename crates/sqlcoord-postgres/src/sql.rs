//! SQL statements, rendered once per schema.

use sqlcoord_core::error::{CoordError, CoordResult};

/// Default schema holding the lock, queue item and server tables.
pub const DEFAULT_SCHEMA: &str = "sqlcoord";

/// Every statement the backend issues, qualified with one schema.
#[derive(Debug, Clone)]
pub struct Statements {
    schema: String,
    pub(crate) insert_lock: String,
    pub(crate) delete_lock: String,
    pub(crate) delete_expired_locks: String,
    pub(crate) insert_queue_item: String,
    pub(crate) claim_queue_item: String,
    pub(crate) delete_queue_item: String,
    pub(crate) requeue_queue_item: String,
    pub(crate) upsert_server: String,
    pub(crate) delete_server: String,
    pub(crate) delete_timed_out_servers: String,
    pub(crate) live_servers: String,
}

impl Statements {
    /// Renders the statements for `schema`.
    ///
    /// Schema names are limited to ASCII letters, digits and underscores and
    /// may not start with a digit.
    pub fn new(schema: &str) -> CoordResult<Self> {
        validate_schema(schema)?;
        let lock = format!("\"{schema}\".\"lock\"");
        let item = format!("\"{schema}\".\"queue_item\"");
        let server = format!("\"{schema}\".\"server\"");

        Ok(Self {
            schema: schema.to_string(),
            insert_lock: format!(
                "INSERT INTO {lock} (resource, acquired, acquirer) VALUES ($1, now(), $2) \
                 ON CONFLICT (resource) DO NOTHING"
            ),
            delete_lock: format!("DELETE FROM {lock} WHERE resource = $1 AND acquirer = $2"),
            delete_expired_locks: format!(
                "DELETE FROM {lock} \
                 WHERE acquired < now() - make_interval(secs => $1) \
                 AND NOT (acquirer = ANY($2::text[]))"
            ),
            insert_queue_item: format!(
                "INSERT INTO {item} (job_ref, queue_name) VALUES ($1, $2) RETURNING id"
            ),
            claim_queue_item: format!(
                "UPDATE {item} SET claimed_at = now() \
                 WHERE id = (\
                 SELECT id FROM {item} \
                 WHERE queue_name = ANY($1::text[]) \
                 AND (claimed_at IS NULL OR claimed_at < now() - make_interval(secs => $2)) \
                 ORDER BY array_position($1::text[], queue_name), id \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED) \
                 RETURNING id, job_ref, queue_name"
            ),
            delete_queue_item: format!("DELETE FROM {item} WHERE id = $1"),
            requeue_queue_item: format!("UPDATE {item} SET claimed_at = NULL WHERE id = $1"),
            upsert_server: format!(
                "INSERT INTO {server} (id, last_heartbeat) VALUES ($1, now()) \
                 ON CONFLICT (id) DO UPDATE SET last_heartbeat = excluded.last_heartbeat"
            ),
            delete_server: format!("DELETE FROM {server} WHERE id = $1"),
            delete_timed_out_servers: format!(
                "DELETE FROM {server} WHERE last_heartbeat < now() - make_interval(secs => $1)"
            ),
            live_servers: format!(
                "SELECT id FROM {server} \
                 WHERE last_heartbeat >= now() - make_interval(secs => $1) ORDER BY id"
            ),
        })
    }

    /// Returns the schema the statements are qualified with.
    pub fn schema(&self) -> &str {
        &self.schema
    }
}

fn validate_schema(schema: &str) -> CoordResult<()> {
    let mut chars = schema.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(CoordError::Configuration(format!(
            "invalid schema name '{schema}'"
        )));
    }
    Ok(())
}
