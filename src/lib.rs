//! A Tokio-based bounded-concurrency batch executor: run one worker over every
//! item of a list, optionally in order, optionally failing fast, with exactly
//! one terminal notification per batch.

mod error;
mod executor;
mod notifier;
mod options;
mod task;
mod worker;

pub use error::{BatchError, PoolError, TaskFailure};
pub use executor::{run, BatchExecutor, BatchOutcome};
pub use notifier::OnDone;
pub use options::PoolOptions;
pub use worker::{async_fn, callback_fn, AsyncWorker, CallbackWorker, Outcome, Reporter, Worker};
