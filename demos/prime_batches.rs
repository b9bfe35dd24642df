use futures::stream;
use futures_conveyor::{batches, Pipeline, PoolConfig};
use tracing::info;

fn is_prime(n: u64) -> bool {
  if n < 2 {
    return false;
  }
  let mut d = 2;
  while d * d <= n {
    if n % d == 0 {
      return false;
    }
    d += 1;
  }
  true
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Prime Batches Demo ---");

  let limit = 1000u64;
  let batch_size = 30;
  let source = stream::iter(batches(0..limit, batch_size));

  let (results, handle) = Pipeline::new(PoolConfig::new(4).name("primes"))
    .run(source, |batch: Vec<u64>| async move {
      Ok::<_, String>(batch.into_iter().filter(|n| is_prime(*n)).collect::<Vec<_>>())
    })
    .expect("Failed to start pipeline");

  let mut primes: Vec<u64> = Vec::new();
  for result in results.collect_all().await {
    match result.into_output() {
      Ok(found) => primes.extend(found),
      Err(e) => tracing::error!("Batch failed: {}", e),
    }
  }
  primes.sort_unstable();

  let report = handle.join().await.expect("Pipeline join failed");
  info!("{} batches processed, {} primes below {}", report.pool.processed, primes.len(), limit);
  info!("largest: {:?}", primes.last());
  info!("--- Prime Batches Demo End ---");
}
