//! Example: Named locks and the expiry sweep
//!
//! Run with: `cargo run --example lock_service`
//!
//! Uses the in-memory store, so no database is needed.

use sqlcoord::*;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let store = MemoryStore::new();
    let pool = store.pool(PoolOptions::default())?;

    let locks = LockService::new(pool.clone(), LockOptions::default())?;
    let registry = ServerRegistry::new(pool.clone(), ServerOptions::default())?;
    println!("Lock service acquirer: {}", locks.acquirer());

    // Keep this process alive in the registry so the sweep spares its locks.
    let shutdown = CancelSource::new();
    let heartbeat = registry.spawn_heartbeat(locks.acquirer().to_string(), shutdown.token());
    let sweep = locks.spawn_expiry_sweep(registry.clone(), shutdown.token());

    println!("Acquiring lock with 5 second timeout...");
    let mut handle = locks
        .acquire_lock("nightly-report", Duration::from_secs(5))
        .await?;
    println!("Lock acquired on {}", handle.resource());

    // A second service (another process, in real life) cannot get it.
    let other = LockService::new(pool.clone(), LockOptions::default())?;
    match other
        .acquire_lock("nightly-report", Duration::from_millis(200))
        .await
    {
        Err(CoordError::LockTimeout { timeout, .. }) => {
            println!("Other acquirer timed out after {timeout:?}, as expected")
        }
        Ok(_) => println!("Unexpected: lock acquired twice"),
        Err(e) => return Err(e.into()),
    }

    println!("Doing critical work...");
    tokio::time::sleep(Duration::from_millis(100)).await;

    handle.release().await?;
    println!("Lock released");

    // Releasing again reports the violation instead of silently succeeding.
    if let Err(e) = handle.release().await {
        println!("Second release: {e}");
    }

    shutdown.cancel();
    heartbeat.await?;
    sweep.await?;
    println!("Registered servers after shutdown: {:?}", store.server_ids());

    Ok(())
}
