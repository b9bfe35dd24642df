use crate::cancel::{CancelSignal, CancellationController};
use crate::config::PoolConfig;
use crate::error::{PoolError, TaskError};
use crate::intake::{IntakeQueue, QueueConsumer, QueueProducer};
use crate::sink::{ResultStream, TaskResult};
use crate::source::{Submitter, TaskId};

use std::fmt;
use std::future::{self, Future};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// The boxed future an executor drives for one task.
type HandlerFuture<O> = Pin<Box<dyn Future<Output = Result<O, TaskError>> + Send + 'static>>;

type Handler<T, O> = Arc<dyn Fn(T) -> HandlerFuture<O> + Send + Sync + 'static>;

/// Defines how [`WorkerPool::shutdown`] winds the pool down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Closes intake and waits until every queued task has been processed.
  Graceful,
  /// Signals cancellation. Running handlers finish; queued tasks are dropped
  /// and listed in the report.
  Cancel,
}

/// A task currently held by an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightTask {
  pub task_id: TaskId,
  pub worker: usize,
  pub started_at: Instant,
}

/// Final accounting of one pool run, returned by [`WorkerPool::join`].
///
/// Once the intake has stopped accepting tasks,
/// `submitted == processed + dropped.len()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
  pub submitted: u64,
  pub processed: u64,
  pub succeeded: u64,
  pub failed: u64,
  pub panicked: u64,
  /// Tasks accepted by the intake but never dispatched because of cancellation.
  pub dropped: Vec<TaskId>,
  /// Results produced but not delivered (cancelled while the output was
  /// full, or the result stream was dropped).
  pub discarded: u64,
  pub cancelled: bool,
}

impl PoolReport {
  fn absorb(&mut self, executor: ExecutorReport) {
    self.processed += executor.processed;
    self.succeeded += executor.succeeded;
    self.failed += executor.failed;
    self.panicked += executor.panicked;
    self.discarded += executor.discarded;
    self.dropped.extend(executor.dropped);
  }
}

#[derive(Debug, Default)]
struct ExecutorReport {
  processed: u64,
  succeeded: u64,
  failed: u64,
  panicked: u64,
  discarded: u64,
  dropped: Vec<TaskId>,
}

/// A fixed set of executors applying one handler to every submitted task.
///
/// Results are published on a single [`ResultStream`] in completion order.
/// The stream ends only after every executor has returned.
pub struct WorkerPool<T: Send + 'static, O: Send + 'static> {
  pool_name: Arc<String>,
  concurrency: usize,
  semaphore: Arc<Semaphore>,
  submitter: Submitter<T>,
  controller: CancellationController,
  in_flight: Arc<DashMap<TaskId, InFlightTask>>,
  results: Mutex<Option<ResultStream<TaskResult<O>>>>,
  coordinator_handle: Mutex<Option<JoinHandle<PoolReport>>>,
}

impl<T: Send + 'static, O: Send + 'static> fmt::Debug for WorkerPool<T, O> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkerPool")
      .field("pool_name", &self.pool_name)
      .field("concurrency", &self.concurrency)
      .field("active", &self.active_count())
      .field("queued", &self.queued_count())
      .field("cancelled", &self.is_cancelled())
      .finish_non_exhaustive()
  }
}

impl<T: Send + 'static, O: Send + 'static> WorkerPool<T, O> {
  /// Starts a pool with its own cancellation controller.
  ///
  /// `handler` receives each payload by value. An `Err` it returns, or a
  /// panic it raises, becomes an error-tagged result for that task only.
  /// The call of `handler` itself (before its future is first polled) runs
  /// while cancellation is held off, so it must not cancel this pool; do
  /// that from inside the returned future.
  pub fn start<F, Fut, E>(config: PoolConfig, handler: F) -> Result<Self, PoolError>
  where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
  {
    let controller = CancellationController::new(&config.name);
    Self::start_with_controller(config, controller, handler)
  }

  /// Starts a pool that stops when `controller` is signalled.
  pub fn start_with_controller<F, Fut, E>(
    config: PoolConfig,
    controller: CancellationController,
    handler: F,
  ) -> Result<Self, PoolError>
  where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
  {
    config.validate()?;
    let tokio_handle = TokioHandle::try_current().map_err(|_| PoolError::NoRuntime)?;

    let handler: Handler<T, O> = Arc::new(move |payload: T| -> HandlerFuture<O> {
      let fut = handler(payload);
      Box::pin(async move { fut.await.map_err(|e| TaskError::Failed(e.to_string())) })
    });

    let pool_name = Arc::new(config.name.clone());
    let semaphore = Arc::new(Semaphore::new(config.concurrency));
    let in_flight = Arc::new(DashMap::new());
    let submitted = Arc::new(AtomicU64::new(0));
    let (producer, consumer) = IntakeQueue::new(config.queue_capacity).split();
    let (output_tx, output_rx) = mpsc::channel(config.output_capacity);

    let submitter = Submitter::new(pool_name.clone(), producer.clone(), controller.observe(), submitted.clone());

    let coordinator = Coordinator {
      pool_name: pool_name.clone(),
      concurrency: config.concurrency,
      handler,
      producer,
      consumer,
      output: output_tx,
      semaphore: semaphore.clone(),
      in_flight: in_flight.clone(),
      signal: controller.observe(),
      submitted,
    };
    let coordinator_handle = tokio_handle.spawn(
      coordinator
        .run()
        .instrument(info_span!("worker_pool_coordinator", name = %pool_name)),
    );

    info!(
      pool_name = %pool_name,
      concurrency = config.concurrency,
      queue_capacity = config.queue_capacity,
      output_capacity = config.output_capacity,
      "Worker pool started."
    );

    Ok(Self {
      pool_name,
      concurrency: config.concurrency,
      semaphore,
      submitter,
      controller,
      in_flight,
      results: Mutex::new(Some(ResultStream::new(output_rx))),
      coordinator_handle: Mutex::new(Some(coordinator_handle)),
    })
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn concurrency(&self) -> usize {
    self.concurrency
  }

  /// Number of handlers executing right now (permits held).
  pub fn active_count(&self) -> usize {
    self.concurrency - self.semaphore.available_permits()
  }

  /// Number of tasks waiting in the intake.
  pub fn queued_count(&self) -> usize {
    self.submitter.queued()
  }

  /// Snapshot of the tasks executing right now, ordered by task id.
  pub fn in_flight(&self) -> Vec<InFlightTask> {
    let mut tasks: Vec<InFlightTask> = self.in_flight.iter().map(|entry| entry.value().clone()).collect();
    tasks.sort_by_key(|t| t.task_id);
    tasks
  }

  pub fn is_cancelled(&self) -> bool {
    self.controller.is_cancelled()
  }

  pub fn cancel_signal(&self) -> CancelSignal {
    self.controller.observe()
  }

  /// A cloneable producer handle for this pool.
  pub fn submitter(&self) -> Submitter<T> {
    self.submitter.clone()
  }

  pub async fn submit(&self, payload: T) -> Result<TaskId, PoolError> {
    self.submitter.submit(payload).await
  }

  /// Closes intake. Already queued tasks are still processed.
  pub fn close_intake(&self) {
    self.submitter.close();
  }

  /// Requests cooperative shutdown. Idempotent; returns `true` for the call
  /// that actually fired the signal.
  pub fn cancel(&self) -> bool {
    self.controller.signal()
  }

  /// Takes the result stream. Only the first call succeeds.
  pub fn results(&self) -> Result<ResultStream<TaskResult<O>>, PoolError> {
    self.results.lock().take().ok_or(PoolError::ResultsTaken)
  }

  /// Waits for the coordinator to finish and returns the run's report.
  ///
  /// Completes once intake is closed and drained, or once cancellation has
  /// let every running handler finish. If the result stream is never read,
  /// executors block once the output buffer is full, so read results
  /// concurrently when more than `output_capacity` tasks are expected.
  pub async fn join(&self) -> Result<PoolReport, PoolError> {
    let handle_to_await = {
      let mut guard = self.coordinator_handle.lock();
      guard.take()
    };
    let Some(handle) = handle_to_await else {
      trace!(pool_name = %self.pool_name, "Join requested but coordinator handle already taken.");
      return Err(PoolError::AlreadyJoined);
    };

    debug!(pool_name = %self.pool_name, "Waiting for coordinator to join.");
    match handle.await {
      Ok(report) => Ok(report),
      Err(join_error) => {
        error!(pool_name = %self.pool_name, "Error joining coordinator: {:?}", join_error);
        Err(PoolError::CoordinatorFailed(join_error.to_string()))
      }
    }
  }

  /// Winds the pool down according to `mode` and joins it.
  pub async fn shutdown(&self, mode: ShutdownMode) -> Result<PoolReport, PoolError> {
    info!(pool_name = %self.pool_name, "Initiating pool shutdown (mode: {:?}).", mode);
    match mode {
      ShutdownMode::Graceful => self.close_intake(),
      ShutdownMode::Cancel => {
        self.cancel();
      }
    }
    self.join().await
  }
}

impl<T: Send + 'static, O: Send + 'static> Drop for WorkerPool<T, O> {
  fn drop(&mut self) {
    // Never joined: stop the coordinator instead of leaving it parked on an
    // open intake. Nothing is awaited here.
    if self.coordinator_handle.lock().is_some() && !self.controller.is_cancelled() {
      info!(pool_name = %*self.pool_name, "WorkerPool dropped without join. Signalling cancellation.");
      self.controller.signal();
      self.submitter.close();
    } else {
      trace!(pool_name = %*self.pool_name, "Drop: pool already joined or cancelled.");
    }
  }
}

/// Owns the executors and the last output sender.
struct Coordinator<T: Send + 'static, O: Send + 'static> {
  pool_name: Arc<String>,
  concurrency: usize,
  handler: Handler<T, O>,
  producer: QueueProducer<T>,
  consumer: QueueConsumer<T>,
  output: mpsc::Sender<TaskResult<O>>,
  semaphore: Arc<Semaphore>,
  in_flight: Arc<DashMap<TaskId, InFlightTask>>,
  signal: CancelSignal,
  submitted: Arc<AtomicU64>,
}

impl<T: Send + 'static, O: Send + 'static> Coordinator<T, O> {
  async fn run(self) -> PoolReport {
    info!(name = %*self.pool_name, executors = self.concurrency, "Coordinator started.");

    let mut executors = JoinSet::new();
    for worker in 0..self.concurrency {
      let executor = Executor {
        worker,
        pool_name: self.pool_name.clone(),
        handler: self.handler.clone(),
        intake: self.consumer.clone(),
        output: self.output.clone(),
        semaphore: self.semaphore.clone(),
        in_flight: self.in_flight.clone(),
        signal: self.signal.clone(),
      };
      executors.spawn(
        executor
          .run()
          .instrument(info_span!("pool_executor", pool_name = %*self.pool_name, worker)),
      );
    }

    let mut report = PoolReport::default();
    while let Some(joined) = executors.join_next().await {
      match joined {
        Ok(executor_report) => report.absorb(executor_report),
        Err(join_error) => {
          error!(name = %*self.pool_name, "Executor terminated abnormally: {:?}", join_error);
        }
      }
    }

    // Every executor has returned; no result can be written past this point.
    report.cancelled = self.signal.is_cancelled();
    if report.cancelled {
      self.producer.close();
      let remaining = self.consumer.drain_remaining().await;
      report.dropped.extend(remaining.iter().map(|task| task.id()));
    }
    if !report.dropped.is_empty() {
      warn!(
        name = %*self.pool_name,
        count = report.dropped.len(),
        task_ids = ?report.dropped,
        "Tasks dropped without dispatch due to cancellation."
      );
    }

    // Closes the result stream once buffered results are read.
    drop(self.output);

    report.submitted = self.submitted.load(Ordering::Acquire);
    info!(
      name = %*self.pool_name,
      processed = report.processed,
      succeeded = report.succeeded,
      failed = report.failed,
      panicked = report.panicked,
      dropped = report.dropped.len(),
      discarded = report.discarded,
      cancelled = report.cancelled,
      "Coordinator stopped."
    );
    report
  }
}

/// Holds an executor's permit and in-flight entry for the duration of one
/// handler call; both are released on every exit path.
struct ActiveTask {
  _permit: OwnedSemaphorePermit,
  task_id: TaskId,
  in_flight: Arc<DashMap<TaskId, InFlightTask>>,
}

impl Drop for ActiveTask {
  fn drop(&mut self) {
    self.in_flight.remove(&self.task_id);
  }
}

struct Executor<T: Send + 'static, O: Send + 'static> {
  worker: usize,
  pool_name: Arc<String>,
  handler: Handler<T, O>,
  intake: QueueConsumer<T>,
  output: mpsc::Sender<TaskResult<O>>,
  semaphore: Arc<Semaphore>,
  in_flight: Arc<DashMap<TaskId, InFlightTask>>,
  signal: CancelSignal,
}

impl<T: Send + 'static, O: Send + 'static> Executor<T, O> {
  async fn run(self) -> ExecutorReport {
    trace!(name = %*self.pool_name, worker = self.worker, "Executor started.");
    let mut report = ExecutorReport::default();

    while let Some(task) = self.intake.recv(&self.signal).await {
      let (task_id, payload) = task.into_parts();

      // Cancellation may land between dequeue and dispatch.
      if self.signal.is_cancelled() {
        report.dropped.push(task_id);
        break;
      }
      let permit = match self.signal.race(self.semaphore.clone().acquire_owned()).await {
        Some(Ok(permit)) => permit,
        Some(Err(_)) => {
          error!(name = %*self.pool_name, worker = self.worker, "Semaphore closed. Executor exiting.");
          report.dropped.push(task_id);
          break;
        }
        None => {
          report.dropped.push(task_id);
          break;
        }
      };

      // Decision point: the handler is called only while the signal is
      // held open, so nothing new starts once `cancel()` has returned.
      let Some(fut) = self.dispatch(task_id, payload) else {
        debug!(name = %*self.pool_name, worker = self.worker, %task_id, "Cancelled before dispatch.");
        report.dropped.push(task_id);
        break;
      };
      let active = ActiveTask {
        _permit: permit,
        task_id,
        in_flight: self.in_flight.clone(),
      };

      let outcome = Self::invoke(fut).await;
      drop(active);

      report.processed += 1;
      match &outcome {
        Ok(_) => {
          report.succeeded += 1;
          trace!(name = %*self.pool_name, %task_id, "Task succeeded.");
        }
        Err(TaskError::Failed(reason)) => {
          report.failed += 1;
          debug!(name = %*self.pool_name, %task_id, %reason, "Task handler returned an error.");
        }
        Err(TaskError::Panicked(message)) => {
          report.panicked += 1;
          error!(name = %*self.pool_name, %task_id, %message, "Task handler panicked.");
        }
      }

      let result = TaskResult {
        task_id,
        worker: self.worker,
        outcome,
      };
      if !self.deliver(result).await {
        report.discarded += 1;
      }
    }

    trace!(name = %*self.pool_name, worker = self.worker, processed = report.processed, "Executor stopped.");
    report
  }

  /// Calls the handler under the dispatch gate and registers the task as
  /// in flight. Returns `None`, dropping the payload, if cancellation won.
  fn dispatch(&self, task_id: TaskId, payload: T) -> Option<HandlerFuture<O>> {
    let _open = self.signal.hold_open()?;
    self.in_flight.insert(
      task_id,
      InFlightTask {
        task_id,
        worker: self.worker,
        started_at: Instant::now(),
      },
    );
    debug!(name = %*self.pool_name, worker = self.worker, %task_id, "Dispatching task.");
    let handler = &self.handler;
    let fut: HandlerFuture<O> = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
      Ok(fut) => fut,
      Err(panic_payload) => Box::pin(future::ready(Err(TaskError::from_panic(panic_payload)))),
    };
    Some(fut)
  }

  /// Drives a dispatched handler with panics contained to this task.
  async fn invoke(fut: HandlerFuture<O>) -> Result<O, TaskError> {
    match AssertUnwindSafe(fut).catch_unwind().await {
      Ok(outcome) => outcome,
      Err(panic_payload) => Err(TaskError::from_panic(panic_payload)),
    }
  }

  /// Writes a result, waiting for output capacity unless cancelled. Once
  /// cancelled, a single non-blocking attempt is made. Returns `false` if the
  /// result was discarded.
  async fn deliver(&self, result: TaskResult<O>) -> bool {
    let task_id = result.task_id;
    match self.signal.race(self.output.reserve()).await {
      Some(Ok(slot)) => {
        slot.send(result);
        true
      }
      Some(Err(_)) => {
        warn!(name = %*self.pool_name, %task_id, "Result stream dropped. Task outcome discarded.");
        false
      }
      None => match self.output.try_send(result) {
        Ok(()) => true,
        Err(_) => {
          warn!(name = %*self.pool_name, %task_id, "Cancelled while output was full. Task outcome discarded.");
          false
        }
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;

  #[tokio::test]
  async fn start_rejects_invalid_config() {
    let result = WorkerPool::<u32, u32>::start(PoolConfig::new(0), |n: u32| async move { Ok::<_, String>(n) });
    assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
  }

  #[test]
  fn start_outside_runtime_is_an_error() {
    let result = WorkerPool::<u32, u32>::start(PoolConfig::new(1), |n: u32| async move { Ok::<_, String>(n) });
    assert!(matches!(result, Err(PoolError::NoRuntime)));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn in_flight_and_active_counts_track_running_handlers() {
    let started = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(tokio::sync::Notify::new());
    let pool = {
      let started = started.clone();
      let gate = gate.clone();
      WorkerPool::start(PoolConfig::new(2).name("tracking"), move |n: u32| {
        let started = started.clone();
        let gate = gate.clone();
        async move {
          started.fetch_add(1, Ordering::SeqCst);
          gate.notified().await;
          Ok::<_, String>(n)
        }
      })
      .unwrap()
    };

    pool.submit(1).await.unwrap();
    pool.submit(2).await.unwrap();
    pool.submit(3).await.unwrap();
    while started.load(Ordering::SeqCst) < 2 {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(pool.active_count(), 2);
    let running = pool.in_flight();
    assert_eq!(running.len(), 2);
    assert!(running.iter().all(|t| t.worker < 2));
    assert_eq!(pool.queued_count(), 1);

    pool.close_intake();
    // Two calls wake the parked handlers; the third leaves a permit for the last task.
    for _ in 0..3 {
      gate.notify_one();
    }
    let report = pool.join().await.unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(pool.active_count(), 0);
    assert!(pool.in_flight().is_empty());
  }

  #[tokio::test]
  async fn start_rejects_more_executors_than_permits() {
    let config = PoolConfig::new(Semaphore::MAX_PERMITS + 1);
    let result = WorkerPool::<u32, u32>::start(config, |n: u32| async move { Ok::<_, String>(n) });
    assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn no_handler_is_called_after_cancel_returns() {
    let calls = Arc::new(AtomicUsize::new(0));
    let pool = {
      let calls = calls.clone();
      WorkerPool::start(PoolConfig::new(4).name("dispatch_gate").queue_capacity(16), move |n: u32| {
        // Counted in the synchronous part: this is the dispatch itself.
        calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, String>(n) }
      })
      .unwrap()
    };

    let results = pool.results().unwrap();
    let reader = tokio::spawn(results.collect_all());
    let submitter = pool.submitter();
    let feeder = tokio::spawn(async move {
      let mut n = 0u32;
      while submitter.submit(n).await.is_ok() {
        n = n.wrapping_add(1);
      }
    });

    while calls.load(Ordering::SeqCst) < 500 {
      tokio::task::yield_now().await;
    }
    assert!(pool.cancel());
    let calls_at_cancel = calls.load(Ordering::SeqCst);

    feeder.await.unwrap();
    let report = pool.join().await.unwrap();
    reader.await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), calls_at_cancel);
    assert_eq!(report.processed as usize, calls_at_cancel);
  }
}
