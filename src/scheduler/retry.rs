//! Retry of provider calls with exponential backoff and jitter.
//!
//! Only transient provider errors are retried. Waiting between attempts is
//! cut short when the run is cancelled.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::{ProviderError, ProviderResult};

/// Retry policy for provider calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound of the computed delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied after every retry.
    pub multiplier: f64,
    /// Randomize each delay between 0.5x and 1.5x.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Creates a policy with a maximum number of attempts.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based), before jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let millis = (self.initial_delay_ms as f64) * self.multiplier.max(1.0).powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let capped = millis.min(self.max_delay_ms as f64).max(0.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let rounded = capped.round() as u64;
        Duration::from_millis(rounded)
    }

    /// Delay to wait after `attempt` failed with `err`.
    ///
    /// A retry hint from the provider overrides the computed delay.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, err: &ProviderError) -> Duration {
        if let Some(hint) = err.retry_delay() {
            return hint;
        }

        let base = self.base_delay(attempt);
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            base.mul_f64(factor)
        } else {
            base
        }
    }
}

/// Outcome of a retried call.
#[derive(Debug)]
pub struct Attempted<T> {
    /// Final result.
    pub result: ProviderResult<T>,
    /// Number of attempts made.
    pub attempts: u32,
}

/// Runs `operation` until it succeeds, fails permanently or runs out of attempts.
///
/// The closure receives the 1-based attempt number. A cancelled token stops
/// further attempts and yields `ProviderError::Cancelled`.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Attempted<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let err = match operation(attempt).await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(e) => e,
        };

        if !err.is_retryable() || attempt >= max_attempts {
            if err.is_retryable() {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %err,
                    "Operation failed after max retries"
                );
            }
            return Attempted {
                result: Err(err),
                attempts: attempt,
            };
        }

        let delay = policy.delay_for(attempt, &err);
        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %err,
            delay_ms = delay.as_millis(),
            "Operation failed, retrying"
        );

        tokio::select! {
            () = cancel.cancelled() => {
                return Attempted {
                    result: Err(ProviderError::Cancelled),
                    attempts: attempt,
                };
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let out = retry_with_backoff(&fast(), "op", &CancellationToken::new(), |_| async { Ok(42) }).await;
        assert_eq!(out.result, Ok(42));
        assert_eq!(out.attempts, 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);

        let out = retry_with_backoff(&fast(), "op", &CancellationToken::new(), move |_| {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::Timeout {
                        message: String::from("slow"),
                    })
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(out.result, Ok("done"));
        assert_eq!(out.attempts, 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);

        let out: Attempted<()> = retry_with_backoff(&fast(), "op", &CancellationToken::new(), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::validation("bad")) }
        })
        .await;

        assert!(matches!(out.result, Err(ProviderError::Validation { .. })));
        assert_eq!(out.attempts, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let out: Attempted<()> = retry_with_backoff(&fast(), "op", &CancellationToken::new(), |_| async {
            Err(ProviderError::unavailable("down"))
        })
        .await;

        assert!(matches!(out.result, Err(ProviderError::Unavailable { .. })));
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let policy = RetryPolicy {
            initial_delay_ms: 60_000,
            max_delay_ms: 60_000,
            ..fast()
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let out: Attempted<()> = retry_with_backoff(&policy, "op", &cancel, |_| async {
            Err(ProviderError::RateLimited { retry_after_secs: None })
        })
        .await;

        assert_eq!(out.result, Err(ProviderError::Cancelled));
        assert_eq!(out.attempts, 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_retry_after_hint_overrides_delay() {
        let err = ProviderError::RateLimited { retry_after_secs: Some(3) };
        assert_eq!(RetryPolicy::default().delay_for(1, &err), Duration::from_secs(3));
    }
}
