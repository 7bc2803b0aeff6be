//! Bounded exponential backoff for per-message operations

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    fn intervals(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_backoff,
            initial_interval: self.initial_backoff,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.max_backoff,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    /// Delay before the next attempt; a rate limit's retry-after wins, capped by max_backoff
    fn delay_for(&self, error: &SyncError, intervals: &mut ExponentialBackoff) -> Duration {
        let computed = intervals.next_backoff().unwrap_or(self.max_backoff);
        match error {
            SyncError::RateLimitExceeded { retry_after } => {
                Duration::from_secs(*retry_after).min(self.max_backoff)
            }
            _ => computed,
        }
    }

    /// Retry transient errors
    pub async fn run<T, F, Fut>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_if(operation_name, SyncError::is_transient, operation)
            .await
    }

    /// Retry errors accepted by `should_retry`
    pub async fn run_if<T, F, Fut, P>(
        &self,
        operation_name: &str,
        should_retry: P,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&SyncError) -> bool,
    {
        let mut intervals = self.intervals();
        let mut attempts = 0;

        loop {
            attempts += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if should_retry(&e) && attempts < self.max_attempts => {
                    let delay = self.delay_for(&e, &mut intervals);
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
