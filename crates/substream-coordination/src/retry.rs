//! Retry Logic with Exponential Backoff
//!
//! Coordination store calls fail transiently when the store is unreachable
//! (network partition, leader election, restart). Those calls are retried with
//! exponential backoff; every other error is returned immediately.
//!
//! ## Backoff Strategy
//!
//! ```text
//! Attempt 1: initial_backoff
//! Attempt 2: initial_backoff * multiplier
//! Attempt 3: initial_backoff * multiplier^2
//! ...
//! Capped at max_backoff
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use substream_coordination::{retry_with_backoff, RetryPolicy};
//!
//! let offsets = retry_with_backoff(&RetryPolicy::default(), || async {
//!     store.get_committed_offsets(&subscription_id).await
//! })
//! .await?;
//! ```

use crate::error::{CoordinationError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: usize,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    /// - max_retries: 5
    /// - initial_backoff: 100ms
    /// - max_backoff: 30s
    /// - backoff_multiplier: 2.0
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: usize,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff duration = min(initial_backoff * multiplier^attempt, max_backoff)
    pub fn backoff(&self, attempt: usize) -> Duration {
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff = Duration::from_millis(backoff_ms as u64);
        backoff.min(self.max_backoff)
    }

    /// Only an unreachable store is worth retrying
    pub fn is_retryable(&self, error: &CoordinationError) -> bool {
        error.is_transient()
    }
}

/// Retry a coordination store operation with exponential backoff.
///
/// # Returns
///
/// - `Ok(T)` if the operation succeeds within `max_retries`
/// - `Err(e)` on a non-retryable error, or the last error once retries are exhausted
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(error) => {
                if !policy.is_retryable(&error) {
                    return Err(error);
                }

                if attempt >= policy.max_retries {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        error = %error,
                        "Max retries exhausted, giving up"
                    );
                    return Err(error);
                }

                let backoff = policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "Coordination store unavailable, backing off"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
