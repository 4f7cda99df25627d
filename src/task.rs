use crate::error::TaskFailure;
use crate::worker::Outcome;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info_span, trace, Instrument};

/// Observable state of one in-flight worker. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
  Pending,
  Fulfilled,
  Rejected,
}

impl TaskState {
  fn from_u8(raw: u8) -> Self {
    match raw {
      1 => TaskState::Fulfilled,
      2 => TaskState::Rejected,
      _ => TaskState::Pending,
    }
  }

  fn as_u8(self) -> u8 {
    match self {
      TaskState::Pending => 0,
      TaskState::Fulfilled => 1,
      TaskState::Rejected => 2,
    }
  }
}

/// What a task sends back to the dispatcher once it settles.
#[derive(Debug)]
pub(crate) struct Settlement<R, E> {
  pub(crate) index: usize,
  pub(crate) outcome: Result<R, TaskFailure<E>>,
}

/// Internal handle to a worker running on the pool's runtime.
///
/// The state is readable without awaiting, which is how the dispatcher prunes
/// settled tasks from its active window.
#[derive(Debug)]
pub(crate) struct TrackedTask {
  index: usize,
  state: Arc<AtomicU8>,
}

impl TrackedTask {
  /// Spawns `work` for item `index`. Exactly one [`Settlement`] is sent on
  /// `settle_tx` for every spawned task, even if it panics or is dropped.
  pub(crate) fn spawn<R, E>(
    tokio_handle: &TokioHandle,
    pool_name: &Arc<String>,
    index: usize,
    work: Outcome<R, E>,
    settle_tx: UnboundedSender<Settlement<R, E>>,
  ) -> Self
  where
    R: Send + 'static,
    E: Send + 'static,
  {
    let state = Arc::new(AtomicU8::new(TaskState::Pending.as_u8()));
    let guard = SettleGuard {
      index,
      state: state.clone(),
      settle_tx: Some(settle_tx),
    };

    let pool_name_for_task = pool_name.clone();
    tokio_handle.spawn(
      async move {
        let outcome = match AssertUnwindSafe(work).catch_unwind().await {
          Ok(outcome) => outcome,
          Err(_panic_payload) => {
            error!(pool_name = %*pool_name_for_task, index, "Worker panicked during execution.");
            Err(TaskFailure::Panicked)
          }
        };
        guard.settle(outcome);
      }
      .instrument(info_span!("batch_task", pool_name = %**pool_name, index)),
    );

    Self { index, state }
  }

  pub(crate) fn index(&self) -> usize {
    self.index
  }

  pub(crate) fn state(&self) -> TaskState {
    TaskState::from_u8(self.state.load(AtomicOrdering::Acquire))
  }

  pub(crate) fn is_pending(&self) -> bool {
    self.state() == TaskState::Pending
  }
}

/// Travels with the spawned future. Settling consumes it; dropping it unsettled
/// (the runtime tore the task down) reports the item as abandoned.
struct SettleGuard<R, E> {
  index: usize,
  state: Arc<AtomicU8>,
  settle_tx: Option<UnboundedSender<Settlement<R, E>>>,
}

impl<R, E> SettleGuard<R, E> {
  fn settle(mut self, outcome: Result<R, TaskFailure<E>>) {
    self.send(outcome);
  }

  fn send(&mut self, outcome: Result<R, TaskFailure<E>>) {
    let Some(tx) = self.settle_tx.take() else {
      return;
    };
    let state = if outcome.is_ok() {
      TaskState::Fulfilled
    } else {
      TaskState::Rejected
    };
    // State first: once the dispatcher sees the settlement, the task must no
    // longer count as pending.
    self.state.store(state.as_u8(), AtomicOrdering::Release);
    if tx
      .send(Settlement {
        index: self.index,
        outcome,
      })
      .is_err()
    {
      trace!(index = self.index, "Dispatcher is gone, settlement discarded.");
    }
  }
}

impl<R, E> Drop for SettleGuard<R, E> {
  fn drop(&mut self) {
    if self.settle_tx.is_some() {
      self.send(Err(TaskFailure::Abandoned));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;
  use tokio::sync::mpsc;

  fn pool_name() -> Arc<String> {
    Arc::new("task_unit_tests".to_string())
  }

  #[tokio::test]
  async fn test_task_settles_fulfilled() {
    let (tx, mut rx) = mpsc::unbounded_channel::<Settlement<u32, String>>();
    let work: Outcome<u32, String> = Box::pin(async { Ok(7) });
    let task = TrackedTask::spawn(&TokioHandle::current(), &pool_name(), 3, work, tx);

    let settlement = rx.recv().await.unwrap();
    assert_eq!(settlement.index, 3);
    assert_eq!(settlement.outcome, Ok(7));
    assert_eq!(task.index(), 3);
    assert_eq!(task.state(), TaskState::Fulfilled);
    assert!(!task.is_pending());
  }

  #[tokio::test]
  async fn test_task_is_pending_until_it_settles() {
    let (tx, mut rx) = mpsc::unbounded_channel::<Settlement<u32, String>>();
    let work: Outcome<u32, String> = Box::pin(async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      Err(TaskFailure::Reported("late failure".to_string()))
    });
    let task = TrackedTask::spawn(&TokioHandle::current(), &pool_name(), 0, work, tx);
    assert!(task.is_pending());

    let settlement = rx.recv().await.unwrap();
    assert_eq!(
      settlement.outcome,
      Err(TaskFailure::Reported("late failure".to_string()))
    );
    assert_eq!(task.state(), TaskState::Rejected);
  }

  #[tokio::test]
  async fn test_panicking_task_settles_as_panicked() {
    let (tx, mut rx) = mpsc::unbounded_channel::<Settlement<u32, String>>();
    let work: Outcome<u32, String> = Box::pin(async {
      if true {
        panic!("worker blew up");
      }
      Ok(0)
    });
    let task = TrackedTask::spawn(&TokioHandle::current(), &pool_name(), 1, work, tx);

    let settlement = rx.recv().await.unwrap();
    assert_eq!(settlement.outcome, Err(TaskFailure::Panicked));
    assert_eq!(task.state(), TaskState::Rejected);
  }

  #[test]
  fn test_dropped_guard_settles_as_abandoned() {
    let (tx, mut rx) = mpsc::unbounded_channel::<Settlement<u32, String>>();
    let state = Arc::new(AtomicU8::new(TaskState::Pending.as_u8()));
    let guard = SettleGuard {
      index: 5,
      state: state.clone(),
      settle_tx: Some(tx),
    };
    drop(guard);

    let settlement = rx.try_recv().unwrap();
    assert_eq!(settlement.index, 5);
    assert_eq!(settlement.outcome, Err(TaskFailure::Abandoned));
    assert_eq!(TaskState::from_u8(state.load(AtomicOrdering::Acquire)), TaskState::Rejected);
  }
}
