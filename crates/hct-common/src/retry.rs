//! Retry utilities with bounded exponential backoff.
//!
//! Cloud resources settle asynchronously (IP assignment, power state) and
//! freshly booted machines refuse SSH for a while, so every remote call that
//! may legitimately fail for a bit is wrapped in [`retry`]. The policy is
//! bounded by wall-clock time rather than attempt count; the attempt index only
//! drives the delay growth. Errors classified as permanent by [`Retryable`]
//! end the loop on the spot.
//!
//! # Example
//!
//! ```ignore
//! use hct_common::retry::{retry, RetryPolicy};
//!
//! let server = retry(&RetryPolicy::FAST, "wait for private IP", || async {
//!     cloud.get_server_by_id(id).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::Error;

/// Classification consulted by [`retry`] after every failed attempt
pub trait Retryable {
    /// Whether another attempt could plausibly succeed
    fn is_retryable(&self) -> bool {
        true
    }
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        Error::is_retryable(self)
    }
}

impl Retryable for String {}

impl Retryable for &str {}

/// Backoff policy for operations that may fail transiently.
///
/// The delay before attempt `n + 1` is `base_delay * growth_factor^n`. There is
/// no jitter and no cap on the number of attempts; `max_elapsed` alone bounds
/// the loop.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Stop retrying once this much time has passed since the first attempt
    pub max_elapsed: Duration,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Multiplier applied per attempt
    pub growth_factor: f64,
}

impl RetryPolicy {
    /// For calls expected to settle quickly: label updates, listings, power actions.
    pub const FAST: RetryPolicy = RetryPolicy {
        max_elapsed: Duration::from_secs(60),
        base_delay: Duration::from_secs(1),
        growth_factor: 1.1,
    };

    /// For calls with long real-world settle times: server boot, cluster
    /// bootstrap, node registration.
    pub const SLOW: RetryPolicy = RetryPolicy {
        max_elapsed: Duration::from_secs(300),
        base_delay: Duration::from_secs(5),
        growth_factor: 1.1,
    };

    /// Create a policy with the default growth factor
    pub fn new(max_elapsed: Duration, base_delay: Duration) -> Self {
        Self {
            max_elapsed,
            base_delay,
            growth_factor: 1.1,
        }
    }

    /// Delay to sleep after the attempt with the given zero-based index failed
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.growth_factor.powi(attempt.min(i32::MAX as u32) as i32);
        Duration::from_secs_f64(self.base_delay.as_secs_f64() * factor)
    }
}

/// Execute an async operation until it succeeds or the policy's time budget is spent.
///
/// The operation always runs at least once. Each failure is logged at debug
/// level with the raw error. A permanent error is returned immediately; when
/// the budget is exhausted the last error is returned unchanged.
pub async fn retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + Retryable,
{
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                debug!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "Attempt failed"
                );
                if !e.is_retryable() {
                    return Err(e);
                }
                if start.elapsed() >= policy.max_elapsed {
                    return Err(e);
                }
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}
