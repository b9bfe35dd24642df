use thiserror::Error;

/// Errors returned by the pool, its intake and its coordinator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("Invalid pool configuration: {0}")]
  InvalidConfig(String),

  #[error("No Tokio runtime is available to run the pool")]
  NoRuntime,

  #[error("Pool is shutting down or already shut down, cannot accept new tasks")]
  PoolShuttingDown,

  #[error("Intake queue is closed, no further tasks can be submitted")]
  IntakeClosed,

  #[error("Result stream was already taken from this pool")]
  ResultsTaken,

  #[error("Pool coordinator was already joined")]
  AlreadyJoined,

  #[error("Pool coordinator terminated abnormally: {0}")]
  CoordinatorFailed(String),
}

/// The error marker carried by a [`TaskResult`](crate::TaskResult) whose handler did not
/// produce an output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
  #[error("Task handler failed: {0}")]
  Failed(String),

  #[error("Task handler panicked: {0}")]
  Panicked(String),
}

impl TaskError {
  /// Renders a `catch_unwind` payload into a readable message.
  pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
    let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
      (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
      s.clone()
    } else {
      "non-string panic payload".to_string()
    };
    TaskError::Panicked(message)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn panic_payloads_are_rendered() {
    let from_str = TaskError::from_panic(Box::new("boom"));
    assert_eq!(from_str, TaskError::Panicked("boom".to_string()));

    let from_string = TaskError::from_panic(Box::new(format!("task {} exploded", 7)));
    assert_eq!(from_string, TaskError::Panicked("task 7 exploded".to_string()));

    let opaque = TaskError::from_panic(Box::new(42u32));
    assert_eq!(opaque, TaskError::Panicked("non-string panic payload".to_string()));
  }
}
