//! Retry with exponential backoff

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::DeleteError;

/// How many times to attempt a deletion and how long to wait in between.
///
/// The wait after attempt `k` is `base_delay * 2^(k-1)`: 100, 200, 400,
/// 800 ms with the default base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay: Self::DEFAULT_BASE_DELAY,
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Backoff after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Returns the number of attempts used on success, or the last error
    /// together with the attempts used.
    pub async fn run<F, Fut>(&self, label: &str, mut op: F) -> Result<u32, (DeleteError, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), DeleteError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(()) => return Ok(attempt),
                Err(e) if !e.is_retryable() => return Err((e, attempt)),
                Err(e) if attempt >= self.attempts => return Err((e, attempt)),
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    debug!(
                        resource = %label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Deletion failed, backing off: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(tidyrun_common::config::DEFAULT_RETRIES)
    }
}
