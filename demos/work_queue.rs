//! Example: Producers and consumers sharing prioritized queues
//!
//! Run with: `cargo run --example work_queue`
//!
//! Uses the in-memory store, so no database is needed.

use sqlcoord::*;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let store = MemoryStore::new();
    let queue = WorkQueue::new(
        store.pool(PoolOptions::default())?,
        QueueOptions {
            poll_interval: Duration::from_millis(100),
            ..QueueOptions::default()
        },
    )?;

    for i in 0..3 {
        queue.enqueue("default", &format!("email-{i}")).await?;
    }
    queue.enqueue("critical", "password-reset").await?;
    println!("Enqueued {} items", store.item_count());

    let shutdown = CancelSource::new();
    let mut workers = Vec::new();
    for worker in 0..2 {
        let queue = queue.clone();
        let cancel = shutdown.token();
        workers.push(tokio::spawn(async move {
            let mut failed_once = false;
            loop {
                let mut lease = match queue.dequeue(&["critical", "default"], &cancel).await {
                    Ok(lease) => lease,
                    Err(CoordError::Cancelled) => break,
                    Err(e) => {
                        eprintln!("worker {worker}: dequeue failed: {e}");
                        break;
                    }
                };
                println!(
                    "worker {worker}: processing {} from {}",
                    lease.job_ref(),
                    lease.queue_name()
                );

                // Pretend one job fails once and goes back to the queue.
                if lease.job_ref() == "email-1" && !failed_once {
                    failed_once = true;
                    println!("worker {worker}: handing {} back", lease.job_ref());
                    lease.requeue().await?;
                    continue;
                }
                lease.acknowledge().await?;
            }
            Ok::<_, CoordError>(())
        }));
    }

    while store.item_count() > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    shutdown.cancel();
    for worker in workers {
        worker.await??;
    }
    println!("All items processed");

    Ok(())
}
