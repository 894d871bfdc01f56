//! PostgreSQL backend for sqlcoord.
//!
//! Locks, queue items and server heartbeats are rows in three tables of one
//! schema (default `sqlcoord`). Lock mutual exclusion rests on the unique
//! `resource` column; queue claims use `FOR UPDATE SKIP LOCKED` so
//! concurrent consumers never wait on each other's candidate rows. Every
//! timestamp comes from the database's `now()`.
//!
//! The tables are expected to exist:
//!
//! ```sql
//! CREATE TABLE sqlcoord.lock (
//!     resource TEXT PRIMARY KEY,
//!     acquired TIMESTAMPTZ NOT NULL,
//!     acquirer TEXT NOT NULL
//! );
//! CREATE TABLE sqlcoord.queue_item (
//!     id BIGSERIAL PRIMARY KEY,
//!     job_ref TEXT NOT NULL,
//!     queue_name TEXT NOT NULL,
//!     claimed_at TIMESTAMPTZ NULL
//! );
//! CREATE TABLE sqlcoord.server (
//!     id TEXT PRIMARY KEY,
//!     last_heartbeat TIMESTAMPTZ NOT NULL
//! );
//! ```

pub mod connection;
pub mod provider;
pub mod sql;

pub use connection::{PostgresConnection, PostgresConnectionManager};
pub use provider::{
    PostgresLockService, PostgresServerRegistry, PostgresStore, PostgresStoreBuilder,
    PostgresWorkQueue,
};
pub use sql::{DEFAULT_SCHEMA, Statements};
