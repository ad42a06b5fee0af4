//! Retry Logic with Exponential Backoff
//!
//! Used in two places:
//!
//! - The producer's flush worker retries a failed broker send a bounded
//!   number of times before dropping the batch.
//! - Pipeline startup probes the broker and the store with jittered backoff
//!   until a connection deadline passes.
//!
//! The consumer only borrows [`RetryPolicy::backoff`] to pace redeliveries:
//! a failed persist is retried by the broker, not by a loop here.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  RetryPolicy                 │
//! │  - max_retries: 3            │
//! │  - initial_backoff: 100ms    │
//! │  - max_backoff: 5s           │
//! │  - backoff_multiplier: 2.0   │
//! └──────┬───────────────────────┘
//!        │
//!        ├─→ Attempt 1: Immediate
//!        ├─→ Attempt 2: Wait 100ms (backoff)
//!        ├─→ Attempt 3: Wait 200ms (backoff * 2)
//!        └─→ Attempt 4: Wait 400ms (backoff * 4)
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Retry policy configuration for exponential backoff.
///
/// ```text
/// backoff = min(initial_backoff * multiplier^attempt, max_backoff)
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first one
    pub max_retries: usize,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
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

    /// Default policy with a different retry budget.
    pub fn with_max_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Calculate backoff duration for a given attempt number (0-indexed).
    ///
    /// ```ignore
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.backoff(0), Duration::from_millis(100));
    /// assert_eq!(policy.backoff(1), Duration::from_millis(200));
    /// ```
    pub fn backoff(&self, attempt: usize) -> Duration {
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff = Duration::from_millis(backoff_ms as u64);
        backoff.min(self.max_backoff)
    }

    /// Backoff with ±25% random jitter.
    ///
    /// ```text
    /// jittered_backoff = backoff * (0.75 + random(0.0, 0.5))
    /// ```
    pub fn jittered_backoff(&self, attempt: usize) -> Duration {
        let backoff = self.backoff(attempt);
        let jitter = 0.75 + rand::random::<f64>() * 0.5;
        Duration::from_millis((backoff.as_millis() as f64 * jitter) as u64)
    }
}

/// Retry an operation with exponential backoff.
///
/// 1. Try operation
/// 2. If success, return result
/// 3. If `is_retryable` rejects the error, return it immediately
/// 4. If retries remain, sleep for the backoff and try again
/// 5. If all retries are exhausted, return the last error
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    policy: &RetryPolicy,
    is_retryable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: Display,
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
            Err(e) => {
                if !is_retryable(&e) {
                    warn!(error = %e, "Non-retryable error, giving up");
                    return Err(e);
                }

                if attempt >= policy.max_retries {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        error = %e,
                        "Max retries exhausted, giving up"
                    );
                    return Err(e);
                }

                let backoff = policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retryable error, backing off"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Retry an operation with jittered backoff until it succeeds or `deadline`
/// passes.
///
/// Every error is retried; `max_retries` is ignored. The last error is
/// returned once the next backoff would end past the deadline.
pub async fn retry_until_deadline<F, Fut, T, E>(
    policy: &RetryPolicy,
    deadline: Instant,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
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
            Err(e) => {
                let backoff = policy.jittered_backoff(attempt);
                if Instant::now() + backoff > deadline {
                    warn!(
                        attempt = attempt + 1,
                        error = %e,
                        "Deadline reached, giving up"
                    );
                    return Err(e);
                }

                debug!(
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Not ready yet, backing off"
                );
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
