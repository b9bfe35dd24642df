use crate::error::PoolError;

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Semaphore;

lazy_static::lazy_static! {
  static ref NEXT_UNNAMED_POOL: AtomicU64 = AtomicU64::new(0);
}

const DEFAULT_QUEUE_CAPACITY: usize = 64;
const DEFAULT_OUTPUT_CAPACITY: usize = 64;

/// Construction parameters for a [`WorkerPool`](crate::WorkerPool).
///
/// Passed explicitly to every constructor; the crate keeps no shared
/// configuration state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
  /// Used in log fields and span names.
  pub name: String,
  /// Number of executors, and the size of the permit set.
  pub concurrency: usize,
  /// Tasks that may wait in the intake before `submit` applies backpressure.
  pub queue_capacity: usize,
  /// Results that may wait in the output before executors block.
  pub output_capacity: usize,
}

impl PoolConfig {
  pub fn new(concurrency: usize) -> Self {
    let seq = NEXT_UNNAMED_POOL.fetch_add(1, Ordering::Relaxed);
    Self {
      name: format!("pool-{}", seq),
      concurrency,
      queue_capacity: DEFAULT_QUEUE_CAPACITY,
      output_capacity: DEFAULT_OUTPUT_CAPACITY,
    }
  }

  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn queue_capacity(mut self, capacity: usize) -> Self {
    self.queue_capacity = capacity;
    self
  }

  pub fn output_capacity(mut self, capacity: usize) -> Self {
    self.output_capacity = capacity;
    self
  }

  pub fn validate(&self) -> Result<(), PoolError> {
    for (field, value) in [
      ("concurrency", self.concurrency),
      ("queue_capacity", self.queue_capacity),
      ("output_capacity", self.output_capacity),
    ] {
      if value == 0 {
        return Err(PoolError::InvalidConfig(format!("{} must be at least 1", field)));
      }
      // Tokio's semaphore and bounded channels panic above this.
      if value > Semaphore::MAX_PERMITS {
        return Err(PoolError::InvalidConfig(format!(
          "{} must be at most {}, got {}",
          field,
          Semaphore::MAX_PERMITS,
          value
        )));
      }
    }
    Ok(())
  }
}

impl Default for PoolConfig {
  /// One executor per available core.
  fn default() -> Self {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    Self::new(cores)
  }
}
