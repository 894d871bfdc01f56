//! Example: Using the PostgreSQL store
//!
//! Run with: `cargo run --example postgres_store`
//!
//! Requires a PostgreSQL database with the sqlcoord tables installed. Set
//! SQLCOORD_DATABASE_URL (or DATABASE_URL); SQLCOORD_SCHEMA and
//! SQLCOORD_MAX_CONNECTIONS are optional.

use sqlcoord::*;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    println!("Connecting to PostgreSQL...");
    let store = PostgresStoreBuilder::from_env()?.build().await?;
    println!("Connected: {:?}", store.pool().status());

    let locks = store.lock_service()?;
    let queue = store.work_queue()?;

    let mut handle = locks
        .acquire_lock("example-resource", Duration::from_secs(5))
        .await?;
    println!("Lock acquired by {}", handle.acquirer());

    let id = queue.enqueue("default", "job-A").await?;
    println!("Enqueued item {id}");

    let mut lease = queue
        .dequeue(&["default"], &cancel::after(Duration::from_secs(5)))
        .await?;
    println!("Dequeued {} ({})", lease.job_ref(), lease.id());
    lease.acknowledge().await?;

    handle.release().await?;
    println!("Lock released");

    store.close();
    Ok(())
}
