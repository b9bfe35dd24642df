//! Heartbeat-driven liveness monitoring.
//!
//! A watched process holds a [`Heartbeat`] and calls [`Heartbeat::beat`]
//! periodically. The [`LivenessMonitor`] waits for either the next beat or
//! its deadline, whichever comes first:
//!
//! ```text
//! WaitingForFirstHeartbeat ──beat──► Alive ◄──beat──┐
//!          │                           │            │
//!          │                           └────────────┘
//!          └──────── deadline ───────► TimedOut   (terminal, reported once)
//!   any state ───── cancellation ────► Stopped    (terminal, no TimedOut)
//! ```
//!
//! The deadline is measured from monitor start until the first beat arrives,
//! and from the previous beat afterwards. Reaching a terminal state never
//! closes the heartbeat channel under the sender; late beats are ignored.

use crate::cancel::CancelSignal;
use crate::error::PoolError;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use fibre::mpsc::{self as fibre_mpsc, AsyncReceiver, AsyncSender};
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Creates a connected heartbeat sender and receiver.
pub fn heartbeat_channel() -> (Heartbeat, HeartbeatReceiver) {
  let (tx, rx) = fibre_mpsc::unbounded_async();
  (Heartbeat { tx }, HeartbeatReceiver { rx })
}

/// Sending side, held by the watched process.
#[derive(Clone)]
pub struct Heartbeat {
  tx: AsyncSender<()>,
}

impl Heartbeat {
  /// Asserts liveness. Returns `false` once no monitor listens anymore.
  pub async fn beat(&self) -> bool {
    self.tx.send(()).await.is_ok()
  }
}

/// Receiving side, handed to [`LivenessMonitor::watch`].
pub struct HeartbeatReceiver {
  rx: AsyncReceiver<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
  WaitingForFirstHeartbeat,
  Alive,
  TimedOut,
  Stopped,
}

impl LivenessState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, LivenessState::TimedOut | LivenessState::Stopped)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
  /// A heartbeat arrived; `beats` counts all beats so far.
  Alive { beats: u64 },
  /// No heartbeat within the timeout window. Emitted at most once.
  TimedOut { silent_for: Duration, beats: u64 },
  /// Monitoring ended through cancellation.
  Stopped,
}

/// Stream of [`LivenessEvent`]s, ending when the monitor stops.
#[derive(Debug)]
pub struct LivenessEvents {
  rx: mpsc::UnboundedReceiver<LivenessEvent>,
}

impl LivenessEvents {
  pub async fn recv(&mut self) -> Option<LivenessEvent> {
    self.rx.recv().await
  }
}

impl Stream for LivenessEvents {
  type Item = LivenessEvent;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<LivenessEvent>> {
    self.get_mut().rx.poll_recv(cx)
  }
}

/// Handle to a running monitor.
pub struct LivenessMonitor {
  name: Arc<String>,
  timeout: Duration,
  state: watch::Receiver<LivenessState>,
  events: Mutex<Option<LivenessEvents>>,
  join_handle: Mutex<Option<JoinHandle<LivenessState>>>,
}

impl LivenessMonitor {
  /// Starts watching `heartbeats`. Must be called from within a Tokio runtime.
  pub fn watch(name: &str, heartbeats: HeartbeatReceiver, timeout: Duration, signal: CancelSignal) -> Self {
    let name = Arc::new(name.to_string());
    let (state_tx, state_rx) = watch::channel(LivenessState::WaitingForFirstHeartbeat);
    // Unbounded so a slow event reader can never delay the deadline.
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let join_handle = tokio::spawn(
      run_monitor(name.clone(), heartbeats, timeout, signal, state_tx, events_tx)
        .instrument(info_span!("liveness_monitor", monitor = %name)),
    );

    Self {
      name,
      timeout,
      state: state_rx,
      events: Mutex::new(Some(LivenessEvents { rx: events_rx })),
      join_handle: Mutex::new(Some(join_handle)),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  pub fn state(&self) -> LivenessState {
    *self.state.borrow()
  }

  /// Takes the event stream. Only the first call returns `Some`.
  pub fn events(&self) -> Option<LivenessEvents> {
    self.events.lock().take()
  }

  /// Waits for the monitor to reach its terminal state.
  pub async fn wait(&self) -> Result<LivenessState, PoolError> {
    let handle = self.join_handle.lock().take().ok_or(PoolError::AlreadyJoined)?;
    handle
      .await
      .map_err(|join_error| PoolError::CoordinatorFailed(format!("liveness monitor {}: {}", self.name, join_error)))
  }
}

/// Roughly 30 years; the same horizon Tokio uses for an unreachable sleep.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `from + timeout`, clamped so huge timeouts such as `Duration::MAX` mean
/// "never" instead of overflowing.
fn deadline_after(from: Instant, timeout: Duration) -> Instant {
  from
    .checked_add(timeout)
    .unwrap_or_else(|| from + FAR_FUTURE)
}

async fn run_monitor(
  name: Arc<String>,
  heartbeats: HeartbeatReceiver,
  timeout: Duration,
  signal: CancelSignal,
  state_tx: watch::Sender<LivenessState>,
  events_tx: mpsc::UnboundedSender<LivenessEvent>,
) -> LivenessState {
  info!(monitor = %name, ?timeout, "Liveness monitor started.");
  let mut last_beat = Instant::now();
  let mut beats = 0u64;
  let mut listening = true;

  let deadline = tokio::time::sleep_until(deadline_after(last_beat, timeout));
  tokio::pin!(deadline);

  let terminal = loop {
    tokio::select! {
      biased;

      _ = signal.cancelled() => {
        info!(monitor = %name, beats, "Liveness monitor cancelled.");
        let _ = events_tx.send(LivenessEvent::Stopped);
        break LivenessState::Stopped;
      }

      received = heartbeats.rx.recv(), if listening => {
        match received {
          Ok(()) => {
            beats += 1;
            last_beat = Instant::now();
            deadline.as_mut().reset(deadline_after(last_beat, timeout));
            if beats == 1 {
              state_tx.send_replace(LivenessState::Alive);
              debug!(monitor = %name, "First heartbeat received.");
            }
            trace!(monitor = %name, beats, "Heartbeat received.");
            let _ = events_tx.send(LivenessEvent::Alive { beats });
          }
          Err(_) => {
            // The current deadline still stands.
            debug!(monitor = %name, beats, "All heartbeat senders dropped.");
            listening = false;
          }
        }
      }

      _ = &mut deadline => {
        let silent_for = last_beat.elapsed();
        warn!(monitor = %name, beats, ?silent_for, "No heartbeat within timeout.");
        let _ = events_tx.send(LivenessEvent::TimedOut { silent_for, beats });
        break LivenessState::TimedOut;
      }
    }
  };

  state_tx.send_replace(terminal);
  terminal
}
