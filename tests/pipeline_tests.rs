use futures::stream::{self, StreamExt};
use futures_conveyor::{
  collect, heartbeat_channel, merge_all, CancellationController, FeedEnd, LivenessEvent, LivenessState,
  Pipeline, PoolConfig, TaskResult, TimeoutPolicy, WorkerPool,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

// Helper to initialize tracing for tests (call once per test run, not per test function)
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,futures_conveyor=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

#[tokio::test]
async fn test_finite_pipeline_processes_every_item() {
  setup_tracing_for_test();
  let pipeline_name = "test_pipeline_finite";
  tracing::info!("Starting test: {}", pipeline_name);

  let (results, handle) = Pipeline::new(PoolConfig::new(3).name(pipeline_name).queue_capacity(2))
    .run(stream::iter(1..=25u64), |n: u64| async move {
      sleep(Duration::from_millis(n % 4)).await;
      Ok::<_, String>(n * n)
    })
    .unwrap();

  let squares: HashSet<u64> = results.map(|r| r.into_output().unwrap()).collect().await;
  let report = handle.join().await.unwrap();

  assert_eq!(squares, (1..=25u64).map(|n| n * n).collect());
  assert_eq!(report.feed.fed, 25);
  assert_eq!(report.feed.end, FeedEnd::Exhausted);
  assert_eq!(report.pool.processed, 25);
  assert!(!report.pool.cancelled);
  assert_eq!(report.liveness, None);
  tracing::info!("Finished test: {}", pipeline_name);
}

#[tokio::test]
async fn test_silent_pipeline_is_cancelled_on_liveness_timeout() {
  setup_tracing_for_test();
  let pipeline_name = "test_pipeline_liveness_cancel";
  tracing::info!("Starting test: {}", pipeline_name);

  // Nobody ever beats; the heartbeat sender stays alive but silent.
  let (_heartbeat, heartbeats) = heartbeat_channel();
  let (results, mut handle) = Pipeline::new(PoolConfig::new(2).name(pipeline_name).queue_capacity(4))
    .with_liveness(heartbeats, Duration::from_millis(150), TimeoutPolicy::CancelPipeline)
    .run(stream::iter(0u64..), |n: u64| async move {
      sleep(Duration::from_millis(20)).await;
      Ok::<_, String>(n)
    })
    .unwrap();

  let mut events = handle.liveness_events().expect("supervised pipeline exposes events");
  assert!(handle.liveness_events().is_none());

  let reader = tokio::spawn(results.collect_all());
  let report = tokio::time::timeout(Duration::from_secs(3), handle.join())
    .await
    .expect("endless pipeline was not stopped by the liveness timeout")
    .unwrap();
  let delivered = reader.await.unwrap();

  assert_eq!(report.liveness, Some(LivenessState::TimedOut));
  assert_eq!(report.feed.end, FeedEnd::Cancelled);
  assert!(report.pool.cancelled);
  assert_eq!(
    report.pool.submitted,
    report.pool.processed + report.pool.dropped.len() as u64
  );
  assert_eq!(delivered.len() as u64 + report.pool.discarded, report.pool.processed);

  match events.recv().await {
    Some(LivenessEvent::TimedOut { beats, silent_for }) => {
      assert_eq!(beats, 0);
      assert!(silent_for >= Duration::from_millis(150));
    }
    other => panic!("expected a timeout event, got {:?}", other),
  }
  assert_eq!(events.recv().await, None);
  tracing::info!("Finished test: {}", pipeline_name);
}

#[tokio::test]
async fn test_report_policy_lets_pipeline_finish() {
  setup_tracing_for_test();
  let (_heartbeat, heartbeats) = heartbeat_channel();
  let (results, handle) = Pipeline::new(PoolConfig::new(2).name("test_pipeline_report_policy"))
    .with_liveness(heartbeats, Duration::from_millis(50), TimeoutPolicy::Report)
    .run(stream::iter(0..6u32), |n: u32| async move {
      sleep(Duration::from_millis(60)).await;
      Ok::<_, String>(n)
    })
    .unwrap();

  let delivered = results.collect_all().await;
  let report = handle.join().await.unwrap();

  assert_eq!(delivered.len(), 6);
  assert!(!report.pool.cancelled);
  assert_eq!(report.feed.end, FeedEnd::Exhausted);
  assert_eq!(report.liveness, Some(LivenessState::TimedOut));
}

#[tokio::test]
async fn test_beating_pipeline_stops_monitor_cleanly() {
  setup_tracing_for_test();
  let (heartbeat, heartbeats) = heartbeat_channel();
  let done = Arc::new(AtomicBool::new(false));

  let beater = {
    let done = done.clone();
    tokio::spawn(async move {
      while !done.load(Ordering::SeqCst) {
        if !heartbeat.beat().await {
          break;
        }
        sleep(Duration::from_millis(10)).await;
      }
    })
  };

  let (results, handle) = Pipeline::new(PoolConfig::new(2).name("test_pipeline_supervised"))
    .with_liveness(heartbeats, Duration::from_millis(200), TimeoutPolicy::CancelPipeline)
    .run(stream::iter(0..10u32), |n: u32| async move {
      sleep(Duration::from_millis(15)).await;
      Ok::<_, String>(n + 1)
    })
    .unwrap();

  let delivered = results.collect_all().await;
  let report = handle.join().await.unwrap();
  done.store(true, Ordering::SeqCst);
  beater.await.unwrap();

  assert_eq!(delivered.len(), 10);
  assert!(!report.pool.cancelled);
  assert_eq!(report.liveness, Some(LivenessState::Stopped));
}

#[tokio::test]
async fn test_external_cancel_stops_endless_pipeline() {
  setup_tracing_for_test();
  let controller = CancellationController::new("test_pipeline_external");
  let (results, handle) = Pipeline::new(PoolConfig::new(2).name("test_pipeline_external"))
    .with_controller(controller.clone())
    .run(stream::repeat(7u8), |n: u8| async move {
      sleep(Duration::from_millis(5)).await;
      Ok::<_, String>(n)
    })
    .unwrap();

  let reader = tokio::spawn(results.collect_all());
  sleep(Duration::from_millis(60)).await;
  assert!(handle.pool().active_count() > 0 || handle.pool().queued_count() > 0);
  assert!(handle.cancel());
  assert!(controller.is_cancelled());
  assert!(!controller.signal(), "the pipeline already fired this controller");
  assert!(!handle.pool().cancel(), "the pool was already cancelled through the pipeline");

  let report = tokio::time::timeout(Duration::from_secs(2), handle.join()).await.unwrap().unwrap();
  let delivered = reader.await.unwrap();

  assert!(report.pool.cancelled);
  assert_eq!(report.feed.end, FeedEnd::Cancelled);
  assert!(report.pool.processed > 0);
  assert!(delivered.iter().all(|r| r.outcome == Ok(7)));
}

#[tokio::test]
async fn test_multiplexed_sources_feed_one_pipeline() {
  setup_tracing_for_test();
  let evens = stream::iter((0..20u32).step_by(2));
  let odds = stream::iter((1..20u32).step_by(2)).then(|n| async move {
    sleep(Duration::from_millis(1)).await;
    n
  });
  let sources = vec![evens.boxed(), odds.boxed()];

  let (results, handle) = Pipeline::new(PoolConfig::new(4).name("test_pipeline_multiplexed"))
    .run(merge_all(sources), |n: u32| async move { Ok::<_, String>(n) })
    .unwrap();

  let mut seen: Vec<u32> = results.map(|r| r.into_output().unwrap()).collect().await;
  seen.sort_unstable();
  let report = handle.join().await.unwrap();

  assert_eq!(seen, (0..20).collect::<Vec<_>>());
  assert_eq!(report.feed.fed, 20);
}

#[tokio::test]
async fn test_collect_fans_in_two_pools() {
  setup_tracing_for_test();
  let doubler = WorkerPool::start(PoolConfig::new(2).name("test_fan_in_doubler"), |n: i64| async move {
    Ok::<_, String>(n * 2)
  })
  .unwrap();
  let negator = WorkerPool::start(PoolConfig::new(2).name("test_fan_in_negator"), |n: i64| async move {
    sleep(Duration::from_millis(2)).await;
    Ok::<_, String>(-n)
  })
  .unwrap();

  let merged = collect(vec![doubler.results().unwrap(), negator.results().unwrap()], 4);
  let reader = tokio::spawn(merged.collect_all());

  for n in 1..=10 {
    doubler.submit(n).await.unwrap();
    negator.submit(n).await.unwrap();
  }
  doubler.close_intake();
  negator.close_intake();
  doubler.join().await.unwrap();
  negator.join().await.unwrap();

  let merged: Vec<TaskResult<i64>> = reader.await.unwrap();
  let mut outputs: Vec<i64> = merged.into_iter().map(|r| r.into_output().unwrap()).collect();
  outputs.sort_unstable();
  let mut expected: Vec<i64> = (1..=10).map(|n| n * 2).chain((1..=10).map(|n| -n)).collect();
  expected.sort_unstable();
  assert_eq!(outputs, expected);
}
