//! Bounded polling.

use std::future::Future;
use std::time::Duration;

use tracing::trace;

use crate::error::{FsError, FsResult};

/// Max attempts, base interval and multiplicative backoff for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    /// Factor applied to the interval after each attempt; 1.0 is constant.
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval: Duration::from_secs(1),
            backoff: 1.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration, backoff: f64) -> Self {
        Self {
            max_attempts,
            interval,
            backoff,
        }
    }

    /// Delay after the zero-based `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff.max(1.0).powi(attempt as i32);
        self.interval.mul_f64(factor.min(1e6))
    }

    /// Run `check` until it yields a value, an error, or the attempts run out.
    ///
    /// Errors from `check` end the loop immediately; running out of attempts
    /// is [`FsError::Timeout`].
    pub async fn poll_until<T, F, Fut>(&self, what: &str, mut check: F) -> FsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FsResult<Option<T>>>,
    {
        for attempt in 0..self.max_attempts {
            if let Some(value) = check().await? {
                return Ok(value);
            }
            if attempt + 1 < self.max_attempts {
                let delay = self.delay(attempt);
                trace!(what, attempt, ?delay, "not ready, waiting");
                tokio::time::sleep(delay).await;
            }
        }
        Err(FsError::timeout(format!(
            "{what} after {} attempts",
            self.max_attempts
        )))
    }
}
