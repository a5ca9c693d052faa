//! Bounded exponential backoff for server errors.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::SyncError;

/// Retry policy applied to reads and commits alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts including the first one
  pub max_attempts: u32,
  /// Delay before the second attempt; doubles after each failure
  pub base_delay: Duration,
  /// Upper bound for a single delay
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(8),
    }
  }
}

impl RetryPolicy {
  /// A policy that never retries.
  pub fn none() -> Self {
    Self {
      max_attempts: 1,
      ..Self::default()
    }
  }

  /// Delay to wait after the given (1-based) failed attempt.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }

  /// Run `op` until it succeeds, fails with a non-retryable error, or the
  /// attempt budget is exhausted. Returns the last outcome.
  pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, SyncError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
  {
    let max_attempts = self.max_attempts.max(1);
    let mut attempt = 1;
    loop {
      match op().await {
        Err(err) if err.is_retryable() && attempt < max_attempts => {
          let delay = self.delay_for(attempt);
          debug!(attempt, ?delay, error = %err, "retrying after server error");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        outcome => return outcome,
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn fast() -> RetryPolicy {
    RetryPolicy {
      max_attempts: 3,
      base_delay: Duration::from_millis(1),
      max_delay: Duration::from_millis(4),
    }
  }

  #[test]
  fn test_delay_doubles_and_caps() {
    let policy = RetryPolicy {
      max_attempts: 5,
      base_delay: Duration::from_millis(100),
      max_delay: Duration::from_millis(300),
    };
    assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    assert_eq!(policy.delay_for(3), Duration::from_millis(300));
  }

  #[tokio::test]
  async fn test_retries_server_errors_up_to_budget() {
    let calls = AtomicU32::new(0);
    let result: Result<(), _> = fast()
      .run(|| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(SyncError::from_status(503, None)) }
      })
      .await;

    assert!(result.unwrap_err().is_retryable());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_recovers_after_transient_failure() {
    let calls = AtomicU32::new(0);
    let result = fast()
      .run(|| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
          if n == 0 {
            Err(SyncError::from_status(500, None))
          } else {
            Ok(n)
          }
        }
      })
      .await;

    assert_eq!(result, Ok(1));
  }

  #[tokio::test]
  async fn test_does_not_retry_validation_or_connectivity() {
    for status in [0u16, 400, 401] {
      let calls = AtomicU32::new(0);
      let _: Result<(), _> = fast()
        .run(|| {
          calls.fetch_add(1, Ordering::SeqCst);
          async move { Err(SyncError::from_status(status, None)) }
        })
        .await;
      assert_eq!(calls.load(Ordering::SeqCst), 1, "status {}", status);
    }
  }
}
