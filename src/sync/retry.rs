//! Retry policy for delegated sync work.

use serde::Deserialize;
use std::time::Duration;

/// Exponential backoff: `initial`, `2 * initial`, `4 * initial`, ... capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Total attempts, including the first one
  pub max_attempts: u32,
  pub initial_backoff_ms: u64,
  pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      initial_backoff_ms: 2_000,
      max_backoff_ms: 5 * 60 * 1_000,
    }
  }
}

impl RetryPolicy {
  /// Retry immediately, `max_attempts` times.
  #[cfg(test)]
  pub fn immediate(max_attempts: u32) -> Self {
    Self {
      max_attempts,
      initial_backoff_ms: 0,
      max_backoff_ms: 0,
    }
  }

  /// Delay before attempt `attempt + 1`, given `attempt` (1-based) just failed.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let delay = self
      .initial_backoff_ms
      .saturating_mul(1u64 << exponent)
      .min(self.max_backoff_ms);
    Duration::from_millis(delay)
  }

  /// At least one attempt is always made.
  pub fn attempts(&self) -> u32 {
    self.max_attempts.max(1)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_backoff_doubles_and_caps() {
    let policy = RetryPolicy {
      max_attempts: 10,
      initial_backoff_ms: 100,
      max_backoff_ms: 1_000,
    };
    assert_eq!(policy.backoff(1), Duration::from_millis(100));
    assert_eq!(policy.backoff(2), Duration::from_millis(200));
    assert_eq!(policy.backoff(4), Duration::from_millis(800));
    assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
    assert_eq!(policy.backoff(64), Duration::from_millis(1_000));
  }

  #[test]
  fn test_zero_attempts_still_tries_once() {
    assert_eq!(RetryPolicy::immediate(0).attempts(), 1);
    assert_eq!(RetryPolicy::immediate(3).backoff(2), Duration::ZERO);
  }
}
