use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

/// Errors raised by the executor itself rather than by a worker.
///
/// These fail fast: they are reported before any worker is dispatched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("max_concurrency must be at least 1, got {0}")]
  InvalidConcurrency(usize),

  #[error("No Tokio runtime is available to spawn batch workers on")]
  NoRuntime,
}

/// Why a single item's worker did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure<E> {
  /// The worker itself reported an error.
  Reported(E),
  /// The worker panicked while running.
  Panicked,
  /// A callback-style worker dropped its `Reporter` without reporting.
  ReporterDropped,
  /// The task was torn down (e.g. runtime shutdown) before it settled.
  Abandoned,
}

impl<E> TaskFailure<E> {
  /// Returns the worker's own error, if that is why the task failed.
  pub fn reported(&self) -> Option<&E> {
    match self {
      TaskFailure::Reported(err) => Some(err),
      _ => None,
    }
  }

  pub fn into_reported(self) -> Option<E> {
    match self {
      TaskFailure::Reported(err) => Some(err),
      _ => None,
    }
  }
}

impl<E: fmt::Display> fmt::Display for TaskFailure<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TaskFailure::Reported(err) => write!(f, "worker reported an error: {}", err),
      TaskFailure::Panicked => f.write_str("worker panicked"),
      TaskFailure::ReporterDropped => f.write_str("worker dropped its reporter without reporting"),
      TaskFailure::Abandoned => f.write_str("worker task was dropped before it settled"),
    }
  }
}

impl<E: StdError + 'static> StdError for TaskFailure<E> {
  fn source(&self) -> Option<&(dyn StdError + 'static)> {
    match self {
      TaskFailure::Reported(err) => Some(err),
      _ => None,
    }
  }
}

/// The error half of a batch outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchError<E> {
  /// The batch was rejected or broke down for reasons unrelated to any worker.
  Pool(PoolError),
  /// `throw_error` was set and the worker for `index` was the first to fail.
  Aborted { index: usize, failure: TaskFailure<E> },
  /// The dispatch token was cancelled after `dispatched` items had been started.
  Cancelled { dispatched: usize },
}

impl<E> BatchError<E> {
  /// Index of the item whose failure aborted the batch, if any.
  pub fn failed_index(&self) -> Option<usize> {
    match self {
      BatchError::Aborted { index, .. } => Some(*index),
      _ => None,
    }
  }

  pub fn failure(&self) -> Option<&TaskFailure<E>> {
    match self {
      BatchError::Aborted { failure, .. } => Some(failure),
      _ => None,
    }
  }
}

impl<E> From<PoolError> for BatchError<E> {
  fn from(err: PoolError) -> Self {
    BatchError::Pool(err)
  }
}

impl<E: fmt::Display> fmt::Display for BatchError<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BatchError::Pool(err) => write!(f, "{}", err),
      BatchError::Aborted { index, failure } => {
        write!(f, "Batch aborted by item {}: {}", index, failure)
      }
      BatchError::Cancelled { dispatched } => {
        write!(f, "Batch cancelled after dispatching {} item(s)", dispatched)
      }
    }
  }
}

impl<E: StdError + 'static> StdError for BatchError<E> {
  fn source(&self) -> Option<&(dyn StdError + 'static)> {
    match self {
      BatchError::Pool(err) => Some(err),
      BatchError::Aborted { failure, .. } => Some(failure),
      BatchError::Cancelled { .. } => None,
    }
  }
}
