//! Worked example: pushes a handful of `increment` jobs against the memory
//! driver, registers a handler that tallies them into a shared counter, and
//! runs until every job has drained.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use queue_core::{AddJobOptions, Plugin, QueueCore};
use queue_driver_memory::MemoryDriver;

/// Stops the run loop once `target` jobs have completed.
struct StopAfter {
    completed: Arc<AtomicUsize>,
    target: usize,
}

#[async_trait]
impl Plugin for StopAfter {
    fn should_keep_running(&self) -> bool {
        self.completed.load(Ordering::SeqCst) < self.target
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let counter = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let increments = 5usize;

    let driver = Arc::new(MemoryDriver::new());
    let queue = {
        let counter = counter.clone();
        let completed = completed.clone();
        QueueCore::builder(driver)
            .with_handler("increment", move |ctx| {
                let counter = counter.clone();
                let completed = completed.clone();
                async move {
                    let by = ctx.payload["by"].as_i64().unwrap_or(1);
                    counter.fetch_add(by as usize, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .with_plugin(StopAfter {
                completed: completed.clone(),
                target: increments,
            })
            .build()
    };

    for by in 1..=increments {
        queue
            .add_job(
                "increment",
                serde_json::json!({ "by": by }),
                AddJobOptions::new(),
            )
            .await?;
    }

    queue
        .run(true, std::time::Duration::from_millis(50))
        .await?;

    println!("final count: {}", counter.load(Ordering::SeqCst));
    Ok(())
}
