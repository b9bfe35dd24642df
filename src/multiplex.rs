//! Fair merging of several independent sources into one stream.
//!
//! Sources are kept in an explicit active set. A source that ends is moved
//! to the exhausted list and never polled again; the merged stream ends
//! once the active set is empty. Each `poll_next` polls every active source
//! at most once, starting after the source that produced the previous item,
//! so no ready source is starved and an idle merge does not spin.

use crate::cancel::CancelSignal;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::{FusedStream, Stream, StreamExt};
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::{debug, trace};

/// Merges keyed sources, yielding `(key, item)` pairs in arrival order.
pub struct Multiplexer<K, S> {
  active: Vec<(K, S)>,
  exhausted: Vec<K>,
  cursor: usize,
  cancel: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
  cancelled: bool,
}

impl<K, S> Multiplexer<K, S> {
  pub fn new() -> Self {
    Self {
      active: Vec::new(),
      exhausted: Vec::new(),
      cursor: 0,
      cancel: None,
      cancelled: false,
    }
  }

  pub fn add(&mut self, key: K, source: S) {
    self.active.push((key, source));
  }

  /// Ends the merged stream early once `signal` fires.
  pub fn with_cancellation(mut self, signal: &CancelSignal) -> Self {
    self.cancel = Some(Box::pin(signal.token().clone().cancelled_owned()));
    self
  }

  /// Sources that may still produce items.
  pub fn active_sources(&self) -> usize {
    self.active.len()
  }

  /// Keys of sources that ran out, in the order they did.
  pub fn exhausted(&self) -> &[K] {
    &self.exhausted
  }

  pub fn was_cancelled(&self) -> bool {
    self.cancelled
  }
}

impl<K, S> Default for Multiplexer<K, S> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K, S> FromIterator<(K, S)> for Multiplexer<K, S> {
  fn from_iter<I: IntoIterator<Item = (K, S)>>(iter: I) -> Self {
    let mut mux = Self::new();
    for (key, source) in iter {
      mux.add(key, source);
    }
    mux
  }
}

impl<K, S> Stream for Multiplexer<K, S>
where
  K: Clone + Unpin + std::fmt::Debug,
  S: Stream + Unpin,
{
  type Item = (K, S::Item);

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let this = self.get_mut();
    if this.cancelled {
      return Poll::Ready(None);
    }
    if let Some(cancel) = this.cancel.as_mut() {
      if cancel.as_mut().poll(cx).is_ready() {
        debug!(active = this.active.len(), "Multiplexer cancelled.");
        this.cancelled = true;
        this.cancel = None;
        return Poll::Ready(None);
      }
    }

    let mut unvisited = this.active.len();
    while unvisited > 0 {
      if this.cursor >= this.active.len() {
        this.cursor = 0;
      }
      let index = this.cursor;
      match Pin::new(&mut this.active[index].1).poll_next(cx) {
        Poll::Ready(Some(item)) => {
          this.cursor = index + 1;
          return Poll::Ready(Some((this.active[index].0.clone(), item)));
        }
        Poll::Ready(None) => {
          // The next source slides into `index`, so the cursor stays put.
          let (key, _) = this.active.remove(index);
          trace!(source = ?key, remaining = this.active.len(), "Source exhausted.");
          this.exhausted.push(key);
        }
        Poll::Pending => {
          this.cursor = index + 1;
        }
      }
      unvisited -= 1;
    }

    if this.active.is_empty() {
      Poll::Ready(None)
    } else {
      Poll::Pending
    }
  }
}

impl<K, S> FusedStream for Multiplexer<K, S>
where
  K: Clone + Unpin + std::fmt::Debug,
  S: Stream + Unpin,
{
  fn is_terminated(&self) -> bool {
    self.cancelled || self.active.is_empty()
  }
}

/// Merges `sources` into one untagged stream that ends when all of them have.
pub fn merge_all<S>(sources: impl IntoIterator<Item = S>) -> impl Stream<Item = S::Item>
where
  S: Stream,
{
  sources
    .into_iter()
    .enumerate()
    .map(|(index, source)| (index, Box::pin(source)))
    .collect::<Multiplexer<usize, Pin<Box<S>>>>()
    .map(|(_, item)| item)
}
