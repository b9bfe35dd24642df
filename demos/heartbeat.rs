use futures::StreamExt;
use futures_conveyor::{heartbeat_channel, CancellationController, LivenessEvent, LivenessMonitor};
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Heartbeat Demo ---");

  let (heartbeat, heartbeats) = heartbeat_channel();
  let controller = CancellationController::new("heartbeat-demo");
  let monitor = LivenessMonitor::watch("worker", heartbeats, Duration::from_secs(6), controller.observe());
  let mut events = monitor.events().expect("events are taken once");

  // The watched process beats once a second for three seconds, then goes
  // quiet. The monitor times out six seconds after the last beat.
  let worker = tokio::spawn(async move {
    for i in 1..=3 {
      tokio::time::sleep(Duration::from_secs(1)).await;
      info!("worker: beat {}", i);
      heartbeat.beat().await;
    }
    info!("worker: going silent");
    tokio::time::sleep(Duration::from_secs(8)).await;
    // The monitor has timed out by now; this beat is ignored.
    heartbeat.beat().await
  });

  while let Some(event) = events.next().await {
    match event {
      LivenessEvent::Alive { beats } => info!("monitor: alive ({} beats)", beats),
      LivenessEvent::TimedOut { silent_for, beats } => {
        info!("monitor: timed out after {:?} of silence ({} beats seen)", silent_for, beats)
      }
      LivenessEvent::Stopped => info!("monitor: stopped"),
    }
  }

  let state = monitor.wait().await.expect("monitor join failed");
  info!("final monitor state: {:?}", state);
  let late_beat_delivered = worker.await.expect("worker task failed");
  info!("late beat delivered: {}", late_beat_delivered);
  info!("--- Heartbeat Demo End ---");
}
