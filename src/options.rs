use crate::error::PoolError;

/// Per-batch configuration. Immutable for the duration of one batch.
///
/// The default is unordered, tolerant of worker failures, with a window as
/// wide as the input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolOptions {
  /// Process items strictly one at a time, in input order.
  pub keep_order: bool,
  /// Abort the batch on the first worker failure instead of leaving a `None` slot.
  pub throw_error: bool,
  /// Upper bound on simultaneously running workers. Ignored when `keep_order` is set.
  pub max_concurrency: Option<usize>,
}

impl PoolOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn keep_order(mut self, keep_order: bool) -> Self {
    self.keep_order = keep_order;
    self
  }

  pub fn throw_error(mut self, throw_error: bool) -> Self {
    self.throw_error = throw_error;
    self
  }

  pub fn max_concurrency(mut self, limit: usize) -> Self {
    self.max_concurrency = Some(limit);
    self
  }

  /// Rejects options that can never drive a batch.
  pub fn validate(&self) -> Result<(), PoolError> {
    match self.max_concurrency {
      Some(0) => Err(PoolError::InvalidConcurrency(0)),
      _ => Ok(()),
    }
  }

  /// Number of workers allowed in flight for a batch of `total` items.
  ///
  /// Callers must have validated the options first.
  pub(crate) fn window(&self, total: usize) -> usize {
    if self.keep_order {
      1
    } else {
      self.max_concurrency.unwrap_or(total).min(total).max(1)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_are_unordered_and_tolerant() {
    let options = PoolOptions::default();
    assert!(!options.keep_order);
    assert!(!options.throw_error);
    assert_eq!(options.max_concurrency, None);
    assert_eq!(options.validate(), Ok(()));
  }

  #[test]
  fn test_zero_concurrency_is_rejected() {
    let options = PoolOptions::new().max_concurrency(0);
    assert_eq!(options.validate(), Err(PoolError::InvalidConcurrency(0)));
  }

  #[test]
  fn test_window_sizes() {
    assert_eq!(PoolOptions::new().window(6), 6);
    assert_eq!(PoolOptions::new().max_concurrency(3).window(6), 3);
    // A limit wider than the input never opens more slots than there are items.
    assert_eq!(PoolOptions::new().max_concurrency(10).window(4), 4);
    // Ordered mode is serial no matter what limit was given.
    assert_eq!(PoolOptions::new().keep_order(true).max_concurrency(5).window(6), 1);
  }
}
