//! Fan-in of many concurrent writers into one consumption point.
//!
//! Writers never close the shared channel themselves. A single closer owns
//! the last sender and drops it only after a `JoinSet` of all writers has
//! drained, so the consumer never observes an end of stream while a write is
//! still possible.

use crate::cancel::CancelSignal;
use crate::error::TaskError;
use crate::source::TaskId;

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, trace};

/// Outcome of processing one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult<O> {
  pub task_id: TaskId,
  /// Index of the executor that ran the handler.
  pub worker: usize,
  pub outcome: Result<O, TaskError>,
}

impl<O> TaskResult<O> {
  pub fn is_ok(&self) -> bool {
    self.outcome.is_ok()
  }

  pub fn into_output(self) -> Result<O, TaskError> {
    self.outcome
  }
}

/// The single consumption point of a fan-in.
///
/// Ends once every writer has finished and all buffered items were read.
#[derive(Debug)]
pub struct ResultStream<R> {
  rx: mpsc::Receiver<R>,
}

impl<R> ResultStream<R> {
  pub(crate) fn new(rx: mpsc::Receiver<R>) -> Self {
    Self { rx }
  }

  /// Receives the next item in arrival order, or `None` once the stream ended.
  pub async fn recv(&mut self) -> Option<R> {
    self.rx.recv().await
  }

  /// Reads the stream to its end.
  pub async fn collect_all(mut self) -> Vec<R> {
    let mut items = Vec::new();
    while let Some(item) = self.rx.recv().await {
      items.push(item);
    }
    items
  }
}

impl<O> ResultStream<TaskResult<O>> {
  /// Reads the stream to its end and splits outputs from error markers.
  pub async fn partition(self) -> (Vec<(TaskId, O)>, Vec<(TaskId, TaskError)>) {
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    for result in self.collect_all().await {
      match result.outcome {
        Ok(output) => succeeded.push((result.task_id, output)),
        Err(e) => failed.push((result.task_id, e)),
      }
    }
    (succeeded, failed)
  }
}

impl<R> Stream for ResultStream<R> {
  type Item = R;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<R>> {
    self.get_mut().rx.poll_recv(cx)
  }
}

/// Merges several streams into one [`ResultStream`], each drained by its own
/// concurrent writer. The merged stream ends once every source has ended.
///
/// Writers stop early only when the consumer is dropped. Must be called from
/// within a Tokio runtime.
pub fn collect<S, R>(sources: impl IntoIterator<Item = S>, capacity: usize) -> ResultStream<R>
where
  S: Stream<Item = R> + Send + 'static,
  R: Send + 'static,
{
  collect_until(sources, capacity, CancelSignal::never())
}

/// Like [`collect`], but writers also stop when `signal` fires.
pub fn collect_until<S, R>(
  sources: impl IntoIterator<Item = S>,
  capacity: usize,
  signal: CancelSignal,
) -> ResultStream<R>
where
  S: Stream<Item = R> + Send + 'static,
  R: Send + 'static,
{
  let (tx, rx) = mpsc::channel(capacity.max(1));
  let mut writers = JoinSet::new();

  for (index, source) in sources.into_iter().enumerate() {
    let tx = tx.clone();
    let signal = signal.clone();
    writers.spawn(async move {
      futures::pin_mut!(source);
      let mut forwarded = 0usize;
      while let Some(Some(item)) = signal.race(source.next()).await {
        match signal.race(tx.send(item)).await {
          Some(Ok(())) => forwarded += 1,
          _ => break,
        }
      }
      trace!(source = index, forwarded, "Fan-in writer finished.");
      forwarded
    });
  }

  tokio::spawn(async move {
    let mut total = 0usize;
    while let Some(joined) = writers.join_next().await {
      match joined {
        Ok(forwarded) => total += forwarded,
        Err(join_error) => error!("Fan-in writer terminated abnormally: {:?}", join_error),
      }
    }
    // Barrier passed: this is the last sender.
    drop(tx);
    debug!(total, "All fan-in writers finished, sink closed.");
  });

  ResultStream::new(rx)
}
