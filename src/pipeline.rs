//! Source → intake → pool → sink, with optional liveness supervision.
//!
//! A [`Pipeline`] owns one cancellation controller. The pool and the
//! liveness monitor run under child controllers of it, so cancelling the
//! pipeline stops everything while the monitor can still be stopped on its
//! own once the pool has finished.

use crate::cancel::CancellationController;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::liveness::{HeartbeatReceiver, LivenessEvents, LivenessMonitor, LivenessState};
use crate::pool::{PoolReport, WorkerPool};
use crate::sink::{ResultStream, TaskResult};
use crate::source::{feed, FeedReport};

use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures::Stream;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

/// What a pipeline does when its liveness monitor times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
  /// Only report the timeout (event stream and final report).
  Report,
  /// Cancel the whole pipeline.
  CancelPipeline,
}

struct LivenessSetup {
  heartbeats: HeartbeatReceiver,
  timeout: Duration,
  policy: TimeoutPolicy,
}

pub struct Pipeline {
  config: PoolConfig,
  controller: CancellationController,
  liveness: Option<LivenessSetup>,
}

impl Pipeline {
  pub fn new(config: PoolConfig) -> Self {
    let controller = CancellationController::new(&format!("{}-pipeline", config.name));
    Self {
      config,
      controller,
      liveness: None,
    }
  }

  /// Runs the pipeline under a caller-owned controller, e.g. one wired to an
  /// OS signal.
  pub fn with_controller(mut self, controller: CancellationController) -> Self {
    self.controller = controller;
    self
  }

  /// Supervises the pipeline with a heartbeat monitor.
  pub fn with_liveness(mut self, heartbeats: HeartbeatReceiver, timeout: Duration, policy: TimeoutPolicy) -> Self {
    self.liveness = Some(LivenessSetup {
      heartbeats,
      timeout,
      policy,
    });
    self
  }

  pub fn controller(&self) -> CancellationController {
    self.controller.clone()
  }

  /// Starts all stages. Must be called from within a Tokio runtime.
  ///
  /// The feeder closes the intake when `source` runs out; the result stream
  /// ends after the last task was processed.
  pub fn run<T, O, S, F, Fut, E>(
    self,
    source: S,
    handler: F,
  ) -> Result<(ResultStream<TaskResult<O>>, PipelineHandle<T, O>), PoolError>
  where
    T: Send + 'static,
    O: Send + 'static,
    S: Stream<Item = T> + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
  {
    let name = self.config.name.clone();
    let pool_controller = self.controller.child(&format!("{}-pool", name));
    let pool = WorkerPool::start_with_controller(self.config, pool_controller, handler)?;
    let results = pool.results()?;

    let feeder = tokio::spawn(feed(pool.submitter(), source).instrument(info_span!("pipeline_feeder", pipeline = %name)));

    let mut liveness_events = None;
    let liveness = self.liveness.map(|setup| {
      let stopper = self.controller.child(&format!("{}-liveness", name));
      let monitor = LivenessMonitor::watch(&name, setup.heartbeats, setup.timeout, stopper.observe());
      liveness_events = monitor.events();

      let pipeline_controller = self.controller.clone();
      let policy = setup.policy;
      let pipeline_name = name.clone();
      let watcher = tokio::spawn(async move {
        let state = monitor.wait().await?;
        if state == LivenessState::TimedOut {
          match policy {
            TimeoutPolicy::CancelPipeline => {
              warn!(pipeline = %pipeline_name, "Liveness timeout. Cancelling pipeline.");
              pipeline_controller.signal();
            }
            TimeoutPolicy::Report => {
              warn!(pipeline = %pipeline_name, "Liveness timeout reported; pipeline keeps running.");
            }
          }
        }
        Ok::<_, PoolError>(state)
      });
      (stopper, watcher)
    });

    info!(pipeline = %name, supervised = liveness.is_some(), "Pipeline started.");
    Ok((
      results,
      PipelineHandle {
        name,
        pool,
        controller: self.controller,
        feeder,
        liveness,
        liveness_events,
      },
    ))
  }
}

/// Final report of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
  pub pool: PoolReport,
  pub feed: FeedReport,
  /// Terminal monitor state, if the pipeline was supervised.
  pub liveness: Option<LivenessState>,
}

/// Control side of a running pipeline.
pub struct PipelineHandle<T: Send + 'static, O: Send + 'static> {
  name: String,
  pool: WorkerPool<T, O>,
  controller: CancellationController,
  feeder: JoinHandle<FeedReport>,
  liveness: Option<(CancellationController, JoinHandle<Result<LivenessState, PoolError>>)>,
  liveness_events: Option<LivenessEvents>,
}

impl<T: Send + 'static, O: Send + 'static> PipelineHandle<T, O> {
  /// Cancels every stage. Idempotent.
  pub fn cancel(&self) -> bool {
    self.controller.signal()
  }

  pub fn pool(&self) -> &WorkerPool<T, O> {
    &self.pool
  }

  /// Takes the liveness event stream of a supervised pipeline.
  pub fn liveness_events(&mut self) -> Option<LivenessEvents> {
    self.liveness_events.take()
  }

  /// Waits for the feeder and the pool, then stops the monitor.
  pub async fn join(self) -> Result<PipelineReport, PoolError> {
    let feed = self
      .feeder
      .await
      .map_err(|e| PoolError::CoordinatorFailed(format!("feeder: {}", e)))?;
    let pool = self.pool.join().await?;

    let liveness = match self.liveness {
      Some((stopper, watcher)) => {
        stopper.signal();
        let state = watcher
          .await
          .map_err(|e| PoolError::CoordinatorFailed(format!("liveness watcher: {}", e)))??;
        Some(state)
      }
      None => None,
    };

    info!(pipeline = %self.name, processed = pool.processed, fed = feed.fed, ?liveness, "Pipeline finished.");
    Ok(PipelineReport { pool, feed, liveness })
  }
}
