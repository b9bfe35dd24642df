use futures::stream;
use futures_conveyor::{CancellationController, Pipeline, PoolConfig};
use std::time::Duration;
use tracing::{info, warn};

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
  use tokio::signal::unix::{signal, SignalKind};

  let mut sigterm = signal(SignalKind::terminate())?;
  let mut sigquit = signal(SignalKind::quit())?;

  tokio::select! {
    res = tokio::signal::ctrl_c() => res?,
    _ = sigterm.recv() => {},
    _ = sigquit.recv() => {},
  }
  Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
  tokio::signal::ctrl_c().await
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Cancel On Signal Demo ---");
  info!("Processing an endless source. Press Ctrl-C to stop.");

  let controller = CancellationController::new("signal-demo");
  {
    let controller = controller.clone();
    tokio::spawn(async move {
      match wait_for_shutdown_signal().await {
        Ok(()) => info!("Shutdown signal received."),
        Err(e) => warn!("Signal handler failed ({}); cancelling anyway.", e),
      }
      controller.signal();
    });
  }

  let jobs = stream::iter(0u64..);
  let (mut results, handle) = Pipeline::new(PoolConfig::new(4).name("signal-demo").queue_capacity(8))
    .with_controller(controller)
    .run(jobs, |n: u64| async move {
      tokio::time::sleep(Duration::from_millis(250)).await;
      Ok::<_, String>(n.wrapping_mul(2_654_435_761) % 1000)
    })
    .expect("Failed to start pipeline");

  while let Some(result) = results.recv().await {
    info!("task {} -> {:?}", result.task_id, result.outcome);
  }

  let report = handle.join().await.expect("Pipeline join failed");
  info!(
    "Stopped after {} tasks; {} queued tasks dropped.",
    report.pool.processed,
    report.pool.dropped.len()
  );
  info!("--- Cancel On Signal Demo End ---");
}
