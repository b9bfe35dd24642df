//! A Tokio-based bounded worker pool with fan-in result collection,
//! cooperative cancellation, heartbeat liveness monitoring and fair
//! multi-source merging.
//!
//! ```text
//! source ──► intake ──► WorkerPool (N executors, N permits) ──► ResultStream
//!                 ▲                ▲
//!          CancellationController  LivenessMonitor
//! ```

mod cancel;
mod config;
mod error;
mod intake;
mod liveness;
mod multiplex;
mod pipeline;
mod pool;
mod sink;
mod source;

pub use cancel::{CancelSignal, CancellationController};
pub use config::PoolConfig;
pub use error::{PoolError, TaskError};
pub use liveness::{
  heartbeat_channel, Heartbeat, HeartbeatReceiver, LivenessEvent, LivenessEvents, LivenessMonitor, LivenessState,
};
pub use multiplex::{merge_all, Multiplexer};
pub use pipeline::{Pipeline, PipelineHandle, PipelineReport, TimeoutPolicy};
pub use pool::{InFlightTask, PoolReport, ShutdownMode, WorkerPool};
pub use sink::{collect, collect_until, ResultStream, TaskResult};
pub use source::{batches, feed, Batches, FeedEnd, FeedReport, Submitter, Task, TaskId};
