use crate::error::{BatchError, PoolError, TaskFailure};
use crate::notifier::{CompletionNotifier, OnDone};
use crate::options::PoolOptions;
use crate::task::{Settlement, TrackedTask};
use crate::worker::{Outcome, Worker};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tokio::runtime::Handle as TokioHandle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Result of one batch: one slot per input item (`None` marks a tolerated
/// failure), or the error that ended the batch.
pub type BatchOutcome<R, E> = Result<Vec<Option<R>>, BatchError<E>>;

/// Runs a worker over a list of items under a concurrency bound.
///
/// An executor holds no per-batch state; every call to [`map`](Self::map) or
/// [`for_each`](Self::for_each) is an independent batch.
#[derive(Debug, Clone)]
pub struct BatchExecutor {
  pool_name: Arc<String>,
  tokio_handle: TokioHandle,
  options: PoolOptions,
  dispatch_token: Option<CancellationToken>,
}

impl BatchExecutor {
  pub fn new(tokio_handle: TokioHandle, pool_name: &str, options: PoolOptions) -> Self {
    Self {
      pool_name: Arc::new(pool_name.to_string()),
      tokio_handle,
      options,
      dispatch_token: None,
    }
  }

  /// Stops dispatching new items once `token` is cancelled.
  ///
  /// Workers that already started are left to finish; the batch then ends with
  /// [`BatchError::Cancelled`].
  pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
    self.dispatch_token = Some(token);
    self
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn options(&self) -> &PoolOptions {
    &self.options
  }

  pub async fn map<T, R, E, W>(&self, items: Vec<T>, worker: W) -> BatchOutcome<R, E>
  where
    W: Worker<T, R, E>,
    R: Send + 'static,
    E: Send + 'static,
  {
    self.execute(items, worker, None).await
  }

  /// Like [`map`](Self::map), also handing the outcome to `on_done` exactly once.
  ///
  /// Under `throw_error`, `on_done` fires as soon as the first failure is
  /// recorded; this future still waits for already-started workers.
  pub async fn map_with<T, R, E, W, D>(&self, items: Vec<T>, worker: W, on_done: D) -> BatchOutcome<R, E>
  where
    W: Worker<T, R, E>,
    R: Send + 'static,
    E: Send + 'static,
    D: FnOnce(&BatchOutcome<R, E>) + Send + 'static,
  {
    self.execute(items, worker, Some(Box::new(on_done))).await
  }

  /// Runs the worker for its effects only.
  pub async fn for_each<T, R, E, W>(&self, items: Vec<T>, worker: W) -> Result<(), BatchError<E>>
  where
    W: Worker<T, R, E>,
    R: Send + 'static,
    E: Send + 'static,
  {
    self.execute(items, worker, None).await.map(|_| ())
  }

  pub async fn for_each_with<T, R, E, W, D>(
    &self,
    items: Vec<T>,
    worker: W,
    on_done: D,
  ) -> Result<(), BatchError<E>>
  where
    W: Worker<T, R, E>,
    R: Send + 'static,
    E: Send + 'static,
    D: FnOnce(&BatchOutcome<R, E>) + Send + 'static,
  {
    self.execute(items, worker, Some(Box::new(on_done))).await.map(|_| ())
  }

  pub(crate) async fn execute<T, R, E, W>(
    &self,
    items: Vec<T>,
    worker: W,
    on_done: Option<OnDone<R, E>>,
  ) -> BatchOutcome<R, E>
  where
    W: Worker<T, R, E>,
    R: Send + 'static,
    E: Send + 'static,
  {
    let notifier = CompletionNotifier::new(self.pool_name.clone(), on_done);

    if let Err(misuse) = self.options.validate() {
      warn!(pool_name = %*self.pool_name, "Rejecting batch before dispatch: {}", misuse);
      let outcome = Err(BatchError::Pool(misuse));
      notifier.notify(&outcome);
      return outcome;
    }

    // Nothing to await, so the receiver fires before this future ever yields.
    if items.is_empty() {
      debug!(pool_name = %*self.pool_name, "Empty batch, completing immediately.");
      let outcome = Ok(Vec::new());
      notifier.notify(&outcome);
      return outcome;
    }

    let total = items.len();
    let window = self.options.window(total);
    if self.options.keep_order && self.options.max_concurrency.is_some() {
      debug!(pool_name = %*self.pool_name, "max_concurrency is ignored in ordered mode.");
    }

    let outcome = self
      .drive(items, &worker, window, &notifier)
      .instrument(info_span!("task_batch", pool_name = %*self.pool_name, items = total, window))
      .await;

    match &outcome {
      Ok(slots) => {
        let failed = slots.iter().filter(|slot| slot.is_none()).count();
        info!(pool_name = %*self.pool_name, total, failed, "Batch completed.");
      }
      Err(err) => {
        info!(pool_name = %*self.pool_name, total, "Batch ended without completing: {}", ErrorSummary(err));
      }
    }
    notifier.notify(&outcome);
    outcome
  }

  fn dispatch_cancelled(&self) -> bool {
    self
      .dispatch_token
      .as_ref()
      .is_some_and(|token| token.is_cancelled())
  }

  /// Builds the outcome for one item. A `Worker::call` that panics settles
  /// its item as [`TaskFailure::Panicked`] instead of unwinding the batch.
  fn prepare<T, R, E, W>(&self, worker: &W, index: usize, item: T) -> Outcome<R, E>
  where
    W: Worker<T, R, E>,
    R: Send + 'static,
    E: Send + 'static,
  {
    match std::panic::catch_unwind(AssertUnwindSafe(|| worker.call(item))) {
      Ok(work) => work,
      Err(_panic_payload) => {
        error!(pool_name = %*self.pool_name, index, "Worker panicked while building its future.");
        Box::pin(futures::future::ready(Err::<R, TaskFailure<E>>(TaskFailure::Panicked)))
      }
    }
  }

  /// The sliding window: keep up to `window` tasks in flight, refill one slot
  /// per settlement, and drain every started task before returning.
  async fn drive<T, R, E, W>(
    &self,
    items: Vec<T>,
    worker: &W,
    window: usize,
    notifier: &CompletionNotifier<R, E>,
  ) -> BatchOutcome<R, E>
  where
    W: Worker<T, R, E>,
    R: Send + 'static,
    E: Send + 'static,
  {
    let total = items.len();
    let mut slots: Vec<Option<R>> = std::iter::repeat_with(|| None).take(total).collect();
    let (settle_tx, mut settle_rx) = mpsc::unbounded_channel::<Settlement<R, E>>();
    // Dropped once nothing more can be dispatched, so the channel closes right
    // after the last started task settles.
    let mut settle_tx = Some(settle_tx);
    let mut undispatched = items.into_iter().enumerate().peekable();
    let mut active: Vec<TrackedTask> = Vec::with_capacity(window);
    let mut dispatched = 0usize;
    let mut halted: Option<BatchError<E>> = None;

    info!(pool_name = %*self.pool_name, total, window, "Batch started.");

    loop {
      while halted.is_none() && active.len() < window && undispatched.peek().is_some() {
        if self.dispatch_cancelled() {
          info!(pool_name = %*self.pool_name, dispatched, "Dispatch token cancelled, no further items will start.");
          halted = Some(BatchError::Cancelled { dispatched });
          break;
        }
        let Some(tx) = settle_tx.as_ref() else {
          break;
        };
        let Some((index, item)) = undispatched.next() else {
          break;
        };
        debug!(pool_name = %*self.pool_name, index, in_flight = active.len() + 1, "Dispatching item.");
        active.push(TrackedTask::spawn(
          &self.tokio_handle,
          &self.pool_name,
          index,
          self.prepare(worker, index, item),
          tx.clone(),
        ));
        dispatched += 1;
      }

      if (halted.is_some() || undispatched.peek().is_none()) && settle_tx.take().is_some() {
        trace!(pool_name = %*self.pool_name, dispatched, "Dispatch finished, draining started tasks.");
      }

      let Some(settlement) = settle_rx.recv().await else {
        break;
      };
      let Settlement { index, outcome } = settlement;

      match outcome {
        Ok(value) => {
          trace!(pool_name = %*self.pool_name, index, "Item fulfilled.");
          slots[index] = Some(value);
        }
        Err(failure) if !self.options.throw_error => {
          warn!(pool_name = %*self.pool_name, index, "Item failed, leaving its slot empty: {}", FailureSummary(&failure));
        }
        Err(failure) => match halted {
          Some(BatchError::Aborted { .. }) => {
            debug!(pool_name = %*self.pool_name, index, "Item failed after the batch was aborted: {}", FailureSummary(&failure));
          }
          _ => {
            error!(pool_name = %*self.pool_name, index, "Item failed, aborting batch: {}", FailureSummary(&failure));
            let aborted: BatchOutcome<R, E> = Err(BatchError::Aborted { index, failure });
            notifier.notify(&aborted);
            halted = aborted.err();
          }
        },
      }

      active.retain(|task| {
        let keep = task.is_pending();
        if !keep {
          trace!(pool_name = %*self.pool_name, index = task.index(), state = ?task.state(), "Pruned settled task from the active window.");
        }
        keep
      });
    }

    match halted {
      Some(err) => Err(err),
      None => Ok(slots),
    }
  }
}

/// Maps `worker` over `items` on the current Tokio runtime.
///
/// `on_done`, when given, receives the outcome exactly once. The returned
/// outcome is the same value.
pub async fn run<T, R, E, W>(
  items: Vec<T>,
  worker: W,
  on_done: Option<OnDone<R, E>>,
  options: PoolOptions,
) -> BatchOutcome<R, E>
where
  W: Worker<T, R, E>,
  R: Send + 'static,
  E: Send + 'static,
{
  match TokioHandle::try_current() {
    Ok(tokio_handle) => {
      BatchExecutor::new(tokio_handle, "run", options)
        .execute(items, worker, on_done)
        .await
    }
    Err(_) => {
      let outcome = Err(BatchError::Pool(PoolError::NoRuntime));
      CompletionNotifier::new(Arc::new("run".to_string()), on_done).notify(&outcome);
      outcome
    }
  }
}

/// Log formatting that does not require the worker's error to be `Display`.
struct FailureSummary<'a, E>(&'a TaskFailure<E>);

impl<E> std::fmt::Display for FailureSummary<'_, E> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.0 {
      TaskFailure::Reported(_) => f.write_str("worker reported an error"),
      TaskFailure::Panicked => f.write_str("worker panicked"),
      TaskFailure::ReporterDropped => f.write_str("worker dropped its reporter"),
      TaskFailure::Abandoned => f.write_str("worker task was abandoned"),
    }
  }
}

struct ErrorSummary<'a, E>(&'a BatchError<E>);

impl<E> std::fmt::Display for ErrorSummary<'_, E> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.0 {
      BatchError::Pool(err) => write!(f, "{}", err),
      BatchError::Aborted { index, failure } => {
        write!(f, "aborted by item {} ({})", index, FailureSummary(failure))
      }
      BatchError::Cancelled { dispatched } => write!(f, "cancelled after {} dispatched", dispatched),
    }
  }
}
