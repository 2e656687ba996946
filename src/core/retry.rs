//! Bounded retry with exponential backoff for index-store calls.
//!
//! Ledger submissions are never retried here: a submission that timed out
//! may still land, so repeating it could anchor the same hash twice.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::index_store::StoreError;

/// Retry policy for retryable index-store errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    100
}
fn default_max_delay() -> u64 {
    2000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `operation` until it succeeds, fails permanently, or the attempt
    /// budget is spent
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && self.should_retry(attempt) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Index store call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
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
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(2000));
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::none().should_retry(1));
    }

    #[test]
    fn test_policy_yaml_defaults() {
        let policy: RetryPolicy = serde_yaml::from_str("max_attempts: 5").unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay_ms, 100);
    }

    #[tokio::test]
    async fn test_run_retries_busy_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .run("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StoreError::Busy("locked".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_conflicts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Conflict {
                    identity: "q".to_string(),
                    message: "changed".to_string(),
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Unavailable("down".to_string()))
            })
            .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
