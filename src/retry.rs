//! Bounded retry with exponential backoff for collaborator calls.
//!
//! The policy only decides how many attempts to make and how long to wait
//! between them; the overall wall-clock budget is enforced by the caller
//! with `tokio::time::timeout`.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{LookThroughError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    Fixed,
    /// delay = initial * multiplier ^ (attempt - 1)
    Exponential { multiplier: f64 },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential { multiplier: 2.0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            backoff_strategy: BackoffStrategy::default(),
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.config.max_retries
    }

    /// Delay before retry number `attempt` (1 for the first retry).
    pub fn get_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let initial_ms = self.config.initial_delay.as_millis() as f64;
        let delay_ms = match self.config.backoff_strategy {
            BackoffStrategy::Fixed => initial_ms,
            BackoffStrategy::Exponential { multiplier } => {
                initial_ms * multiplier.powi(attempt.saturating_sub(1) as i32)
            }
        };
        let delay = Duration::from_millis(delay_ms.max(0.0).min(u64::MAX as f64) as u64);
        delay.min(self.config.max_delay)
    }

    /// Runs `operation` until it succeeds, fails with an error that is not worth
    /// retrying, or the retries are used up. The last error is returned.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if is_retryable(&error) && self.should_retry(attempt) => {
                    attempt += 1;
                    let delay = self.get_delay(attempt);
                    debug!(
                        label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying collaborator call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

fn is_retryable(error: &LookThroughError) -> bool {
    matches!(
        error,
        LookThroughError::Collaborator(_) | LookThroughError::CollaboratorTimeout { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_delays_are_capped() {
        let policy = RetryPolicy::new(
            RetryConfig::default()
                .with_initial_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_millis(350)),
        );
        assert_eq!(policy.get_delay(0), Duration::ZERO);
        assert_eq!(policy.get_delay(1), Duration::from_millis(100));
        assert_eq!(policy.get_delay(2), Duration::from_millis(200));
        assert_eq!(policy.get_delay(3), Duration::from_millis(350));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::new(
            RetryConfig::default()
                .with_initial_delay(Duration::from_millis(50))
                .with_backoff(BackoffStrategy::Fixed),
        );
        assert_eq!(policy.get_delay(4), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::new(RetryConfig::default().with_max_retries(3));

        let result = policy
            .run("flaky", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(LookThroughError::Collaborator("503".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::new(RetryConfig::default().with_max_retries(2));

        let result: Result<()> = policy
            .run("down", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(LookThroughError::Collaborator("down".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_config_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::default();

        let result: Result<()> = policy
            .run("bad", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(LookThroughError::Config("missing key".into()))
            })
            .await;

        assert!(matches!(result, Err(LookThroughError::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
