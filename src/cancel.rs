//! Broadcast, write-once cancellation.
//!
//! A [`CancellationController`] owns the right to fire the signal; components
//! that only need to react receive a [`CancelSignal`], which cannot fire it.
//! Every blocking wait in the crate goes through [`CancelSignal::race`] or an
//! equivalent biased `tokio::select!`, so a fired signal unblocks it promptly.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info};

/// Owner side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancellationController {
  name: Arc<str>,
  token: CancellationToken,
  fired: Arc<AtomicBool>,
  // Shared by a controller and all of its children.
  gate: Arc<RwLock<()>>,
}

impl CancellationController {
  pub fn new(name: &str) -> Self {
    Self {
      name: Arc::from(name),
      token: CancellationToken::new(),
      fired: Arc::new(AtomicBool::new(false)),
      gate: Arc::new(RwLock::new(())),
    }
  }

  /// Fires the signal. Safe to call any number of times from any thread.
  ///
  /// Returns `true` only for the call that moved the signal from clear to
  /// fired; later calls, and calls on a child whose parent already fired,
  /// are no-ops. The signal is visible to every observer by the time any
  /// call returns, and no dispatch started under [`CancelSignal::hold_open`]
  /// is still pending.
  pub fn signal(&self) -> bool {
    let _gate = self.gate.write();
    let already_cancelled = self.token.is_cancelled();
    self.token.cancel();
    let first = !self.fired.swap(true, Ordering::AcqRel) && !already_cancelled;
    if first {
      info!(controller = %self.name, "Cancellation signalled.");
    } else {
      debug!(controller = %self.name, "Cancellation already signalled, ignoring repeat request.");
    }
    first
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  /// Hands out a read-only view of the signal.
  pub fn observe(&self) -> CancelSignal {
    CancelSignal {
      token: self.token.clone(),
      gate: self.gate.clone(),
    }
  }

  /// Creates a controller that fires whenever this one does, but can also be
  /// fired on its own without affecting this one.
  pub fn child(&self, name: &str) -> CancellationController {
    CancellationController {
      name: Arc::from(name),
      token: self.token.child_token(),
      fired: Arc::new(AtomicBool::new(false)),
      gate: self.gate.clone(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

/// Read-only view of a [`CancellationController`].
#[derive(Debug, Clone)]
pub struct CancelSignal {
  token: CancellationToken,
  gate: Arc<RwLock<()>>,
}

impl CancelSignal {
  /// A signal that never fires.
  pub fn never() -> Self {
    Self {
      token: CancellationToken::new(),
      gate: Arc::new(RwLock::new(())),
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  /// Completes once the signal has fired (immediately if it already has).
  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }

  /// Runs `fut` until it completes or the signal fires, whichever is first.
  ///
  /// Returns `None` if cancellation won. When both are ready at the same
  /// poll, cancellation wins.
  pub async fn race<F: Future>(&self, fut: F) -> Option<F::Output> {
    tokio::select! {
      biased;
      _ = self.token.cancelled() => None,
      out = fut => Some(out),
    }
  }

  /// Holds off [`CancellationController::signal`] while the caller starts
  /// something that must not begin after cancellation. Returns `None` if
  /// the signal has already fired.
  ///
  /// The guard must be dropped before any `.await`, and the code run under
  /// it must not fire this signal itself.
  pub(crate) fn hold_open(&self) -> Option<RwLockReadGuard<'_, ()>> {
    let guard = self.gate.read();
    if self.token.is_cancelled() {
      None
    } else {
      Some(guard)
    }
  }

  pub(crate) fn token(&self) -> &CancellationToken {
    &self.token
  }
}
