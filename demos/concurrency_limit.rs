use futures_batch::{async_fn, BatchExecutor, PoolOptions};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::info;

async fn long_task_fn(id: usize) -> Result<String, String> {
  info!("Task {} starting (concurrency test - should take 1s)", id);
  tokio::time::sleep(Duration::from_secs(1)).await;
  let result = format!("Task {} finished", id);
  info!("{}", result);
  Ok(result)
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Concurrency Limit Example (Limit: 2) ---");

  let concurrency_limit = 2;
  let executor = BatchExecutor::new(
    Handle::current(),
    "concurrency_pool",
    PoolOptions::new().max_concurrency(concurrency_limit),
  );

  let num_tasks = 5;
  info!(
    "Running {} tasks, each takes 1 sec. With concurrency {}, this should take ~{} secs.",
    num_tasks,
    concurrency_limit,
    (num_tasks as f32 / concurrency_limit as f32).ceil()
  );

  let started = Instant::now();
  let outcome = executor.map((0..num_tasks).collect(), async_fn(long_task_fn)).await;

  match outcome {
    Ok(slots) => {
      for (index, slot) in slots.into_iter().enumerate() {
        info!("Item {}: {:?}", index, slot);
      }
    }
    Err(e) => tracing::error!("Batch failed: {}", e),
  }

  info!("All tasks processed in {:?}.", started.elapsed());
  info!("--- Concurrency Limit Example End ---");
}
