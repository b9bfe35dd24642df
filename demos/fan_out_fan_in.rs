use futures::StreamExt;
use futures_conveyor::{collect, PoolConfig, ShutdownMode, WorkerPool};
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false) // Disable module paths for cleaner demo output
    .init();

  info!("--- Fan-out / Fan-in Demo ---");

  // Two independent pools, each fanning one kind of work out over three executors.
  let doubler = WorkerPool::start(PoolConfig::new(3).name("doubler").queue_capacity(4), |n: u64| async move {
    tokio::time::sleep(Duration::from_millis(20 * (n % 5))).await;
    Ok::<_, String>(format!("{} * 2 = {}", n, n * 2))
  })
  .expect("Failed to start doubler pool");

  let halves = WorkerPool::start(PoolConfig::new(3).name("halves").queue_capacity(4), |n: u64| async move {
    if n % 2 == 1 {
      return Err(format!("{} is odd", n));
    }
    tokio::time::sleep(Duration::from_millis(15)).await;
    Ok(format!("{} / 2 = {}", n, n / 2))
  })
  .expect("Failed to start halves pool");

  // Fan the two result streams back in to one consumer.
  let mut merged = collect(vec![doubler.results().unwrap(), halves.results().unwrap()], 8);
  let printer = tokio::spawn(async move {
    let mut count = 0;
    while let Some(result) = merged.next().await {
      count += 1;
      match result.outcome {
        Ok(line) => info!("[worker {}] task {}: {}", result.worker, result.task_id, line),
        Err(e) => warn!("[worker {}] task {} failed: {}", result.worker, result.task_id, e),
      }
    }
    count
  });

  for n in [2u64, 34, 5, 1, 1234, 34523, 5212] {
    doubler.submit(n).await.expect("doubler intake closed");
    halves.submit(n).await.expect("halves intake closed");
  }

  let doubler_report = doubler.shutdown(ShutdownMode::Graceful).await.expect("doubler join failed");
  let halves_report = halves.shutdown(ShutdownMode::Graceful).await.expect("halves join failed");
  let printed = printer.await.expect("printer task failed");

  info!(
    "doubler: {} processed, halves: {} processed ({} failed), printed {} results",
    doubler_report.processed, halves_report.processed, halves_report.failed, printed
  );
  info!("--- Fan-out / Fan-in Demo End ---");
}
