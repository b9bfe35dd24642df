use crate::cancel::CancelSignal;
use crate::error::PoolError;
use crate::source::Task;

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// A bounded, multi-producer, multi-consumer queue of tasks.
///
/// Built on a bounded Tokio `mpsc` channel. The single receiver is shared by
/// every executor behind an async mutex, so whichever executor is free first
/// takes the next task. Capacity is the backpressure point for producers.
pub(crate) struct IntakeQueue<T: Send + 'static> {
  tx: mpsc::Sender<Task<T>>,
  rx: mpsc::Receiver<Task<T>>,
}

impl<T: Send + 'static> IntakeQueue<T> {
  pub(crate) fn new(capacity: usize) -> Self {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    Self { tx, rx }
  }

  /// Splits the queue into its producer and consumer halves.
  pub(crate) fn split(self) -> (QueueProducer<T>, QueueConsumer<T>) {
    let queued = Arc::new(AtomicUsize::new(0));
    (
      QueueProducer {
        tx: Arc::new(Mutex::new(Some(self.tx))),
        queued: queued.clone(),
      },
      QueueConsumer {
        rx: Arc::new(AsyncMutex::new(self.rx)),
        queued,
      },
    )
  }
}

/// Producer half. Clones share one sender slot, so `close` from any clone
/// closes the intake for all of them.
pub(crate) struct QueueProducer<T: Send + 'static> {
  tx: Arc<Mutex<Option<mpsc::Sender<Task<T>>>>>,
  queued: Arc<AtomicUsize>,
}

impl<T: Send + 'static> Clone for QueueProducer<T> {
  fn clone(&self) -> Self {
    Self {
      tx: self.tx.clone(),
      queued: self.queued.clone(),
    }
  }
}

impl<T: Send + 'static> fmt::Debug for QueueProducer<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("len", &self.len())
      .field("closed", &self.is_closed())
      .finish_non_exhaustive()
  }
}

impl<T: Send + 'static> QueueProducer<T> {
  /// Sends a task into the queue, waiting for capacity if it is full.
  ///
  /// The wait is raced against `signal`; a task that loses the race is
  /// dropped here and the caller sees `PoolShuttingDown`.
  pub(crate) async fn send(&self, task: Task<T>, signal: &CancelSignal) -> Result<(), PoolError> {
    if signal.is_cancelled() {
      return Err(PoolError::PoolShuttingDown);
    }
    // Clone out of the slot so the lock is not held across the await.
    let tx = self.tx.lock().clone().ok_or(PoolError::IntakeClosed)?;

    // Counted before the send so a fast consumer never decrements below zero.
    self.queued.fetch_add(1, Ordering::AcqRel);
    match signal.race(tx.send(task)).await {
      Some(Ok(())) => Ok(()),
      Some(Err(_)) => {
        self.queued.fetch_sub(1, Ordering::AcqRel);
        if signal.is_cancelled() {
          Err(PoolError::PoolShuttingDown)
        } else {
          Err(PoolError::IntakeClosed)
        }
      }
      None => {
        self.queued.fetch_sub(1, Ordering::AcqRel);
        Err(PoolError::PoolShuttingDown)
      }
    }
  }

  /// Closes the sending side. Returns `true` if this call closed it.
  pub(crate) fn close(&self) -> bool {
    self.tx.lock().take().is_some()
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.tx.lock().is_none()
  }

  /// Number of tasks waiting in the queue.
  pub(crate) fn len(&self) -> usize {
    self.queued.load(Ordering::Acquire)
  }
}

/// Consumer half, shared by all executors of a pool.
pub(crate) struct QueueConsumer<T: Send + 'static> {
  rx: Arc<AsyncMutex<mpsc::Receiver<Task<T>>>>,
  queued: Arc<AtomicUsize>,
}

impl<T: Send + 'static> Clone for QueueConsumer<T> {
  fn clone(&self) -> Self {
    Self {
      rx: self.rx.clone(),
      queued: self.queued.clone(),
    }
  }
}

impl<T: Send + 'static> fmt::Debug for QueueConsumer<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueConsumer").finish_non_exhaustive()
  }
}

impl<T: Send + 'static> QueueConsumer<T> {
  /// Takes the next available task.
  ///
  /// Returns `None` once the queue is closed and drained, or as soon as
  /// `signal` fires. Both the wait for the shared receiver and the wait for
  /// a task are cancellable; a task is never lost to a lost race since
  /// `mpsc::Receiver::recv` is cancel safe.
  pub(crate) async fn recv(&self, signal: &CancelSignal) -> Option<Task<T>> {
    let received = signal
      .race(async {
        let mut rx = self.rx.lock().await;
        rx.recv().await
      })
      .await
      .flatten();
    if received.is_some() {
      self.queued.fetch_sub(1, Ordering::AcqRel);
    }
    received
  }

  /// Closes the queue and returns every task still buffered in it.
  ///
  /// Producers blocked on capacity fail immediately; sends that already
  /// reserved a slot complete and are included.
  pub(crate) async fn drain_remaining(&self) -> Vec<Task<T>> {
    let mut rx = self.rx.lock().await;
    rx.close();
    let mut remaining = Vec::new();
    while let Some(task) = rx.recv().await {
      self.queued.fetch_sub(1, Ordering::AcqRel);
      remaining.push(task);
    }
    remaining
  }
}
