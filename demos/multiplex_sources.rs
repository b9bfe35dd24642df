use futures::stream::{self, StreamExt};
use futures_conveyor::{CancellationController, Multiplexer};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

fn ticker(label: &'static str, period_ms: u64, count: usize) -> mpsc::Receiver<String> {
  let (tx, rx) = mpsc::channel(1);
  tokio::spawn(async move {
    for i in 0..count {
      tokio::time::sleep(Duration::from_millis(period_ms)).await;
      if tx.send(format!("{} #{}", label, i)).await.is_err() {
        break;
      }
    }
  });
  rx
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Multiplex Sources Demo ---");

  let controller = CancellationController::new("multiplex-demo");
  let mut mux = Multiplexer::new().with_cancellation(&controller.observe());
  for (label, period_ms, count) in [("fast", 100, 8), ("slow", 350, 3)] {
    let rx = ticker(label, period_ms, count);
    mux.add(label, stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) }).boxed());
  }

  // Safety net only: both sources finish well before this fires.
  let stopper = controller.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_secs(5)).await;
    stopper.signal();
  });

  while let Some((source, item)) = mux.next().await {
    info!("from {}: {} ({} sources active)", source, item, mux.active_sources());
  }

  info!("exhausted sources: {:?}", mux.exhausted());
  info!("stopped by cancellation: {}", mux.was_cancelled());
  info!("--- Multiplex Sources Demo End ---");
}
