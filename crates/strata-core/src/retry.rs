//! Bounded retry of store calls on transient failures.
//!
//! Uses `backon` for exponential backoff with jitter. Only errors for which
//! [`Error::is_transient`] holds are retried; everything else is returned on
//! the first attempt.

use std::{future::Future, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

/// Retry policy for store calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Total attempts including the first. `1` disables retrying.
  pub max_attempts: u32,
  pub min_delay_ms: u64,
  pub max_delay_ms: u64,
  pub jitter:       bool,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self { max_attempts: 3, min_delay_ms: 50, max_delay_ms: 1_000, jitter: true }
  }
}

impl RetryConfig {
  /// A policy that never retries.
  pub fn none() -> Self { Self { max_attempts: 1, ..Self::default() } }

  /// A policy with no delay between attempts, for tests.
  pub fn immediate(max_attempts: u32) -> Self {
    Self { max_attempts, min_delay_ms: 0, max_delay_ms: 0, jitter: false }
  }

  pub fn backoff(&self) -> ExponentialBuilder {
    let builder = ExponentialBuilder::default()
      .with_min_delay(Duration::from_millis(self.min_delay_ms))
      .with_max_delay(Duration::from_millis(self.max_delay_ms))
      .with_max_times(self.max_attempts.saturating_sub(1) as usize);
    if self.jitter { builder.with_jitter() } else { builder }
  }
}

/// Run `f` under `policy`, retrying while the error is transient.
///
/// `operation` names the call in the retry log line.
pub(crate) async fn retrying<T, E, F, Fut>(
  policy: &RetryConfig,
  operation: &'static str,
  mut f: F,
) -> Result<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
  E: Into<Error>,
{
  let attempt = || {
    let fut = f();
    async move { fut.await.map_err(Into::<Error>::into) }
  };

  attempt
    .retry(policy.backoff())
    .when(Error::is_transient)
    .notify(|err: &Error, delay: Duration| {
      warn!(operation, error = %err, delay = ?delay, "store call failed, retrying");
    })
    .await
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicU32, Ordering};

  use super::*;

  #[tokio::test]
  async fn retries_transient_errors_until_success() {
    let counter = AtomicU32::new(0);
    let calls = &counter;
    let result: Result<u32> = retrying(&RetryConfig::immediate(3), "lookup", || async move {
      let n = calls.fetch_add(1, Ordering::SeqCst);
      if n < 2 {
        Err(Error::StoreUnavailable("busy".into()))
      } else {
        Ok(n)
      }
    })
    .await;
    assert_eq!(result.unwrap(), 2);
    assert_eq!(counter.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn gives_up_after_max_attempts() {
    let counter = AtomicU32::new(0);
    let calls = &counter;
    let result: Result<()> = retrying(&RetryConfig::immediate(3), "lookup", || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      Err(Error::StoreUnavailable("down".into()))
    })
    .await;
    assert!(result.unwrap_err().is_transient());
    assert_eq!(counter.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn permanent_errors_are_not_retried() {
    let counter = AtomicU32::new(0);
    let calls = &counter;
    let result: Result<()> = retrying(&RetryConfig::immediate(5), "lookup", || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      Err(Error::MalformedInput("bad".into()))
    })
    .await;
    assert!(result.is_err());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn defaults_allow_three_attempts() {
    let policy = RetryConfig::default();
    assert_eq!(policy.max_attempts, 3);
    assert_eq!(RetryConfig::none().max_attempts, 1);
  }
}
