use futures_batch::{async_fn, callback_fn, BatchExecutor, BatchOutcome, PoolOptions, Reporter};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

async fn my_task_fn(id: usize, delay_ms: u64) -> Result<String, String> {
  info!("Task {} starting, will sleep for {}ms", id, delay_ms);
  tokio::time::sleep(Duration::from_millis(delay_ms)).await;
  if id == 3 {
    return Err(format!("Task {} gave up after {}ms", id, delay_ms));
  }
  Ok(format!("Task {} finished successfully after {}ms", id, delay_ms))
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false) // Disable module paths for cleaner example output
    .init();

  info!("--- Basic Usage Example ---");

  // Unordered, tolerant of failures: the failed item leaves an empty slot.
  let executor = BatchExecutor::new(Handle::current(), "basic_pool", PoolOptions::new().max_concurrency(2));
  let items: Vec<(usize, u64)> = (0..5).map(|i| (i, 500 + (i as u64 % 3 * 250))).collect();

  let outcome = executor
    .map_with(
      items,
      async_fn(|(id, delay_ms): (usize, u64)| my_task_fn(id, delay_ms)),
      |outcome: &BatchOutcome<String, String>| info!("on_done fired (is_ok: {})", outcome.is_ok()),
    )
    .await;

  match outcome {
    Ok(slots) => {
      for (index, slot) in slots.iter().enumerate() {
        match slot {
          Some(result) => info!("Result for item {}: {}", index, result),
          None => info!("Item {} failed, no result", index),
        }
      }
    }
    Err(e) => info!("Batch error: {}", e),
  }

  // Ordered and fail-fast, with a callback-style worker.
  let strict = BatchExecutor::new(
    Handle::current(),
    "strict_pool",
    PoolOptions::new().keep_order(true).throw_error(true),
  );
  let outcome = strict
    .map(
      vec![1u32, 2, 0, 4],
      callback_fn(|x: u32, reporter: Reporter<u32, String>| {
        if x == 0 {
          reporter.fail("refusing to divide by zero".to_string());
        } else {
          reporter.ok(100 / x);
        }
      }),
    )
    .await;
  info!("Strict batch outcome: {:?}", outcome);

  info!("--- Basic Usage Example End ---");
}
