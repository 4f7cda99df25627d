use crate::executor::BatchOutcome;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace};

/// Terminal-notification receiver for a batch.
///
/// It sees the same outcome the executor returns, by reference.
pub type OnDone<R, E> = Box<dyn FnOnce(&BatchOutcome<R, E>) + Send + 'static>;

/// Delivers a batch's terminal notification exactly once.
///
/// The `notified` flag is a test-and-set guard: however many failures race
/// to report, only the first caller of [`notify`](Self::notify) reaches the receiver.
pub(crate) struct CompletionNotifier<R, E> {
  pool_name: Arc<String>,
  notified: AtomicBool,
  receiver: Mutex<Option<OnDone<R, E>>>,
}

impl<R, E> fmt::Debug for CompletionNotifier<R, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionNotifier")
      .field("pool_name", &self.pool_name)
      .field("notified", &self.is_notified())
      .field("has_receiver", &self.receiver.lock().is_some())
      .finish()
  }
}

impl<R, E> CompletionNotifier<R, E> {
  pub(crate) fn new(pool_name: Arc<String>, receiver: Option<OnDone<R, E>>) -> Self {
    Self {
      pool_name,
      notified: AtomicBool::new(false),
      receiver: Mutex::new(receiver),
    }
  }

  pub(crate) fn is_notified(&self) -> bool {
    self.notified.load(AtomicOrdering::Acquire)
  }

  /// Hands `outcome` to the receiver if no notification was delivered yet.
  /// Returns `true` only for the call that won.
  pub(crate) fn notify(&self, outcome: &BatchOutcome<R, E>) -> bool {
    if self
      .notified
      .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
      .is_err()
    {
      debug!(pool_name = %*self.pool_name, "Notifier: terminal notification already delivered, suppressing.");
      return false;
    }

    let receiver = self.receiver.lock().take();
    match receiver {
      Some(on_done) => {
        debug!(pool_name = %*self.pool_name, is_err = outcome.is_err(), "Notifier: delivering terminal notification.");
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| on_done(outcome)));
        if result.is_err() {
          error!(pool_name = %*self.pool_name, "The batch completion receiver panicked during execution.");
        }
      }
      None => {
        trace!(pool_name = %*self.pool_name, "Notifier: no completion receiver registered, dropping notification.");
      }
    }
    true
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::{BatchError, TaskFailure};
  use std::sync::atomic::AtomicUsize;

  fn counting_notifier(calls: Arc<AtomicUsize>) -> CompletionNotifier<u32, String> {
    CompletionNotifier::new(
      Arc::new("notifier_unit_tests".to_string()),
      Some(Box::new(move |_outcome: &BatchOutcome<u32, String>| {
        calls.fetch_add(1, AtomicOrdering::SeqCst);
      })),
    )
  }

  #[test]
  fn test_only_first_notify_reaches_receiver() {
    let calls = Arc::new(AtomicUsize::new(0));
    let notifier = counting_notifier(calls.clone());

    let first: BatchOutcome<u32, String> = Err(BatchError::Aborted {
      index: 1,
      failure: TaskFailure::Reported("first".to_string()),
    });
    let second: BatchOutcome<u32, String> = Ok(vec![Some(1)]);

    assert!(notifier.notify(&first));
    assert!(!notifier.notify(&second));
    assert!(!notifier.notify(&first));
    assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    assert!(notifier.is_notified());
  }

  #[test]
  fn test_receiver_sees_outcome() {
    let seen = Arc::new(Mutex::new(None));
    let seen_clone = seen.clone();
    let notifier: CompletionNotifier<u32, String> = CompletionNotifier::new(
      Arc::new("notifier_unit_tests".to_string()),
      Some(Box::new(move |outcome: &BatchOutcome<u32, String>| {
        *seen_clone.lock() = Some(outcome.clone());
      })),
    );

    notifier.notify(&Ok(vec![Some(2), None]));
    assert_eq!(*seen.lock(), Some(Ok(vec![Some(2), None])));
  }

  #[test]
  fn test_missing_receiver_still_counts_as_notified() {
    let notifier: CompletionNotifier<u32, String> =
      CompletionNotifier::new(Arc::new("notifier_unit_tests".to_string()), None);
    assert!(notifier.notify(&Ok(Vec::new())));
    assert!(!notifier.notify(&Ok(Vec::new())));
  }

  #[test]
  fn test_panicking_receiver_is_contained() {
    let notifier: CompletionNotifier<u32, String> = CompletionNotifier::new(
      Arc::new("notifier_unit_tests".to_string()),
      Some(Box::new(|_outcome: &BatchOutcome<u32, String>| {
        panic!("receiver failed");
      })),
    );
    assert!(notifier.notify(&Ok(Vec::new())));
    assert!(notifier.is_notified());
  }

  #[test]
  fn test_concurrent_notifies_deliver_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let notifier = Arc::new(counting_notifier(calls.clone()));

    let threads: Vec<_> = (0..8)
      .map(|i| {
        let notifier = notifier.clone();
        std::thread::spawn(move || {
          let outcome: BatchOutcome<u32, String> = Err(BatchError::Aborted {
            index: i,
            failure: TaskFailure::Panicked,
          });
          notifier.notify(&outcome)
        })
      })
      .collect();

    let winners = threads
      .into_iter()
      .map(|t| t.join().unwrap())
      .filter(|won| *won)
      .count();
    assert_eq!(winners, 1);
    assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
  }
}
