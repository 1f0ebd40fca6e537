//! Concurrent checkout example.
//!
//! Starts a small pool backed by the in-memory test factory, lets many tasks
//! compete for its connections, and prints the pool status as they go.
//!
//! # Running
//!
//! ```bash
//! RUST_LOG=debug cargo run -p datasource-pool --example concurrent_checkout
//! ```

// Allow common patterns in example code
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use datasource_pool::{Pool, PoolConfig, PoolError};
use datasource_testing::MockFactory;
use tokio::time::Instant;

const WORKERS: usize = 20;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("=== Concurrent Checkout Example ===\n");

    let config = PoolConfig::new()
        .url("mock://localhost:3306/demo")
        .credentials("root", "root")
        .min_connections(2)
        .max_connections(5)
        .connection_timeout(Duration::from_secs(2))
        .health_check_interval(Duration::from_millis(250));

    println!("Pool configuration: {config:?}\n");

    let factory = MockFactory::new().with_open_delay(Duration::from_millis(20));
    let pool = Pool::new(config, factory.clone()).await?;
    println!("Initial status: {:?}\n", pool.status());

    let start = Instant::now();
    let mut handles = Vec::with_capacity(WORKERS);

    for worker in 0..WORKERS {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let conn = pool.get().await?;
            println!(
                "[{:>6.1?}] worker {worker:>2} got {} (checkout #{})",
                start.elapsed(),
                conn.id(),
                conn.metadata().checkout_count
            );

            // Simulate a query.
            tokio::time::sleep(Duration::from_millis(50)).await;

            pool.release(conn).await?;
            Ok::<_, PoolError>(())
        }));
    }

    let mut failed = 0;
    for handle in handles {
        if let Err(e) = handle.await? {
            println!("worker failed: {e}");
            failed += 1;
        }
    }

    println!("\nAll workers done in {:?} ({failed} failed)", start.elapsed());
    println!("Status after load: {:?}", pool.status());

    // Fail one idle connection and let the background sweep evict it.
    if let Some(victim) = factory.connections().first() {
        victim.kill();
        println!("\nKilled connection {}; waiting for health check...", victim.id());
    }
    tokio::time::sleep(Duration::from_millis(600)).await;
    println!(
        "Status after sweep: {:?} (opened {}, closed {})",
        pool.status(),
        factory.opened(),
        factory.closed()
    );

    pool.shutdown().await;
    println!(
        "\nPool shut down: closed = {}, live connections = {}",
        pool.is_closed(),
        factory.live()
    );

    Ok(())
}
