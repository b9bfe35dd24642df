//! The producer-facing side of a pool: tasks, identifiers and the handles
//! that put tasks into the intake.

use crate::cancel::CancelSignal;
use crate::error::PoolError;
use crate::intake::QueueProducer;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tracing::{debug, info, trace, warn};

/// Opaque identifier of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl From<u64> for TaskId {
  fn from(raw: u64) -> Self {
    TaskId(raw)
  }
}

impl From<TaskId> for u64 {
  fn from(id: TaskId) -> Self {
    id.0
  }
}

impl fmt::Display for TaskId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// One unit of work. Immutable once built; moved into exactly one executor.
#[derive(Debug)]
pub struct Task<T> {
  id: TaskId,
  payload: T,
}

impl<T> Task<T> {
  pub fn new(id: TaskId, payload: T) -> Self {
    Self { id, payload }
  }

  pub fn id(&self) -> TaskId {
    self.id
  }

  pub fn payload(&self) -> &T {
    &self.payload
  }

  pub fn into_parts(self) -> (TaskId, T) {
    (self.id, self.payload)
  }
}

/// Cloneable handle for submitting tasks to one pool.
pub struct Submitter<T: Send + 'static> {
  pool_name: Arc<String>,
  producer: QueueProducer<T>,
  signal: CancelSignal,
  next_id: Arc<AtomicU64>,
  submitted: Arc<AtomicU64>,
}

impl<T: Send + 'static> Clone for Submitter<T> {
  fn clone(&self) -> Self {
    Self {
      pool_name: self.pool_name.clone(),
      producer: self.producer.clone(),
      signal: self.signal.clone(),
      next_id: self.next_id.clone(),
      submitted: self.submitted.clone(),
    }
  }
}

impl<T: Send + 'static> fmt::Debug for Submitter<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Submitter")
      .field("pool_name", &self.pool_name)
      .field("producer", &self.producer)
      .finish_non_exhaustive()
  }
}

impl<T: Send + 'static> Submitter<T> {
  pub(crate) fn new(
    pool_name: Arc<String>,
    producer: QueueProducer<T>,
    signal: CancelSignal,
    submitted: Arc<AtomicU64>,
  ) -> Self {
    Self {
      pool_name,
      producer,
      signal,
      next_id: Arc::new(AtomicU64::new(0)),
      submitted,
    }
  }

  /// Submits a payload under a freshly allocated [`TaskId`].
  ///
  /// Waits while the intake is full. Fails with `PoolShuttingDown` once the
  /// pool is cancelled and with `IntakeClosed` once intake was closed.
  pub async fn submit(&self, payload: T) -> Result<TaskId, PoolError> {
    let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
    self.submit_task(Task::new(id, payload)).await
  }

  /// Submits a task whose identifier the caller chose.
  ///
  /// Identifiers are not checked for uniqueness; mixing this with
  /// [`submit`](Self::submit) on one pool may produce duplicates.
  pub async fn submit_task(&self, task: Task<T>) -> Result<TaskId, PoolError> {
    let id = task.id();
    match self.producer.send(task, &self.signal).await {
      Ok(()) => {
        self.submitted.fetch_add(1, Ordering::AcqRel);
        trace!(pool_name = %self.pool_name, task_id = %id, "Task queued.");
        Ok(id)
      }
      Err(e) => {
        debug!(pool_name = %self.pool_name, task_id = %id, error = %e, "Task rejected by intake.");
        Err(e)
      }
    }
  }

  /// Closes the intake. Tasks already queued are still processed.
  pub fn close(&self) {
    if self.producer.close() {
      info!(pool_name = %self.pool_name, "Intake closed.");
    }
  }

  pub fn is_closed(&self) -> bool {
    self.producer.is_closed()
  }

  /// Number of tasks currently waiting in the intake.
  pub fn queued(&self) -> usize {
    self.producer.len()
  }
}

/// Why a [`feed`] routine stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEnd {
  /// The source ran out of items and the intake was closed.
  Exhausted,
  /// Cancellation fired before the source ran out.
  Cancelled,
  /// Someone else closed the intake while the source still had items.
  IntakeClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedReport {
  pub fed: u64,
  pub end: FeedEnd,
}

/// Drains `source` into the pool behind `submitter`.
///
/// Waiting on the source is raced against cancellation, so an unbounded
/// source stops promptly. When a finite source runs out, the intake is closed.
pub async fn feed<T, S>(submitter: Submitter<T>, source: S) -> FeedReport
where
  T: Send + 'static,
  S: Stream<Item = T>,
{
  futures::pin_mut!(source);
  let mut fed = 0u64;

  let end = loop {
    let next = match submitter.signal.race(source.next()).await {
      Some(next) => next,
      None => break FeedEnd::Cancelled,
    };
    let Some(payload) = next else {
      submitter.close();
      break FeedEnd::Exhausted;
    };
    match submitter.submit(payload).await {
      Ok(_) => fed += 1,
      Err(PoolError::IntakeClosed) => {
        warn!(pool_name = %submitter.pool_name, fed, "Feeder stopped: intake closed while the source still had items.");
        break FeedEnd::IntakeClosed;
      }
      Err(_) => break FeedEnd::Cancelled,
    }
  };

  info!(pool_name = %submitter.pool_name, fed, end = ?end, "Feeder finished.");
  FeedReport { fed, end }
}

/// Groups a finite iterator into chunks of at most `size` items, so that one
/// task can process a whole batch.
pub fn batches<I: IntoIterator>(items: I, size: usize) -> Batches<I::IntoIter> {
  Batches {
    inner: items.into_iter(),
    size: size.max(1),
  }
}

#[derive(Debug, Clone)]
pub struct Batches<I> {
  inner: I,
  size: usize,
}

impl<I: Iterator> Iterator for Batches<I> {
  type Item = Vec<I::Item>;

  fn next(&mut self) -> Option<Self::Item> {
    let batch: Vec<I::Item> = self.inner.by_ref().take(self.size).collect();
    if batch.is_empty() {
      None
    } else {
      Some(batch)
    }
  }
}
