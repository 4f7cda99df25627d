use crate::error::TaskFailure;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::TryFutureExt;
use tokio::sync::oneshot;
use tracing::trace;

/// The unit of work the executor drives for one item.
/// It must be `Send` and `'static`, and settle with the item's result or failure.
pub type Outcome<R, E> = Pin<Box<dyn Future<Output = Result<R, TaskFailure<E>>> + Send + 'static>>;

/// A per-item worker, already normalized to produce an [`Outcome`].
///
/// The worker shape is decided when the worker value is built (see [`async_fn`]
/// and [`callback_fn`]), so the executor never inspects it per item.
pub trait Worker<T, R, E>: Send + Sync {
  fn call(&self, item: T) -> Outcome<R, E>;
}

impl<T, R, E, W> Worker<T, R, E> for Arc<W>
where
  W: Worker<T, R, E> + ?Sized,
{
  fn call(&self, item: T) -> Outcome<R, E> {
    (**self).call(item)
  }
}

impl<T, R, E, W> Worker<T, R, E> for &W
where
  W: Worker<T, R, E> + ?Sized,
{
  fn call(&self, item: T) -> Outcome<R, E> {
    (**self).call(item)
  }
}

/// Wraps a worker that is already awaitable: `Fn(T) -> impl Future<Output = Result<R, E>>`.
///
/// The returned future drives the worker's own future. Nothing else is added.
pub fn async_fn<F>(f: F) -> AsyncWorker<F> {
  AsyncWorker { f: Arc::new(f) }
}

/// Wraps a worker that signals completion through a trailing [`Reporter`].
pub fn callback_fn<F>(f: F) -> CallbackWorker<F> {
  CallbackWorker { f: Arc::new(f) }
}

pub struct AsyncWorker<F> {
  f: Arc<F>,
}

impl<T, R, E, F, Fut> Worker<T, R, E> for AsyncWorker<F>
where
  F: Fn(T) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<R, E>> + Send + 'static,
  T: Send + 'static,
  R: 'static,
  E: 'static,
{
  fn call(&self, item: T) -> Outcome<R, E> {
    let f = Arc::clone(&self.f);
    // Building the worker's future may itself panic; doing it on first poll
    // keeps that inside the task instead of on the dispatcher.
    Box::pin(async move { f(item).map_err(TaskFailure::Reported).await })
  }
}

impl<F> fmt::Debug for AsyncWorker<F> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AsyncWorker").finish_non_exhaustive()
  }
}

pub struct CallbackWorker<F> {
  f: Arc<F>,
}

impl<T, R, E, F> Worker<T, R, E> for CallbackWorker<F>
where
  F: Fn(T, Reporter<R, E>) + Send + Sync + 'static,
  T: Send + 'static,
  R: Send + 'static,
  E: Send + 'static,
{
  fn call(&self, item: T) -> Outcome<R, E> {
    let f = Arc::clone(&self.f);
    // The callback runs inside the future so it executes on the task that
    // drives this item, not on the dispatcher.
    Box::pin(async move {
      let (tx, rx) = oneshot::channel();
      f(item, Reporter { tx });
      match rx.await {
        Ok(result) => result.map_err(TaskFailure::Reported),
        Err(_) => Err(TaskFailure::ReporterDropped),
      }
    })
  }
}

impl<F> fmt::Debug for CallbackWorker<F> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CallbackWorker").finish_non_exhaustive()
  }
}

/// Completion reporter handed to a callback-style worker.
///
/// Reporting consumes the reporter, so an item can settle at most once.
/// Dropping it without reporting settles the item as
/// [`TaskFailure::ReporterDropped`].
pub struct Reporter<R, E> {
  tx: oneshot::Sender<Result<R, E>>,
}

impl<R, E> Reporter<R, E> {
  pub fn report(self, result: Result<R, E>) {
    if self.tx.send(result).is_err() {
      trace!("Reporter: item was already torn down, outcome discarded.");
    }
  }

  pub fn ok(self, value: R) {
    self.report(Ok(value));
  }

  pub fn fail(self, err: E) {
    self.report(Err(err));
  }
}

impl<R, E> fmt::Debug for Reporter<R, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Reporter")
      .field("receiver_alive", &!self.tx.is_closed())
      .finish()
  }
}
