//! Exponential backoff with full jitter
//!
//! One [`BackoffPolicy`] is injected into both the reader wrapper and the
//! batch writer so retry behaviour is configured in a single place.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::Cancelled;
use crate::services::cancellation::CancellationFlag;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Retries without sleeping, for tests and dry runs
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(max_retries, Duration::ZERO, Duration::ZERO)
    }

    /// Total attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Upper bound of the sleep before retry number `retry` (1-based):
    /// `min(max_delay, base_delay * 2^(retry - 1))`
    pub fn ceiling(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Actual sleep before retry number `retry`, uniformly drawn from
    /// `[0, ceiling]`
    pub fn delay(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling(retry);
        if ceiling.is_zero() {
            return ceiling;
        }
        let millis = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, the
    /// retry budget is spent, or `cancel` trips. Returns the last error on
    /// exhaustion. Cancellation is checked before every attempt and wakes a
    /// pending backoff sleep; an attempt already running is never interrupted.
    pub async fn retry<T, E, F, Fut, P>(
        &self,
        cancel: &CancellationFlag,
        operation: &str,
        is_retryable: P,
        mut f: F,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display + From<Cancelled>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                info!(operation = %operation, attempt = attempt, "Run cancelled, no further attempts");
                return Err(Cancelled.into());
            }

            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !is_retryable(&e) => return Err(e),
                Err(e) if attempt >= self.max_attempts() => {
                    error!(
                        operation = %operation,
                        attempts = attempt,
                        error = %e,
                        "Max retries exceeded"
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay(attempt);
                    warn!(
                        operation = %operation,
                        attempt = attempt,
                        max_attempts = self.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Call failed, retrying..."
                    );
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => {}
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReadError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn timeout(message: &str) -> ReadError {
        ReadError::Transient(message.to_string())
    }

    #[test]
    fn test_ceiling_doubles_and_caps() {
        let policy = BackoffPolicy::new(5, Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.ceiling(1), Duration::from_millis(100));
        assert_eq!(policy.ceiling(2), Duration::from_millis(200));
        assert_eq!(policy.ceiling(3), Duration::from_millis(400));
        assert_eq!(policy.ceiling(4), Duration::from_millis(500));
        assert_eq!(policy.ceiling(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jittered_delay_within_ceiling() {
        let policy = BackoffPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));
        for retry in 1..=4 {
            assert!(policy.delay(retry) <= policy.ceiling(retry));
        }
        assert_eq!(BackoffPolicy::immediate(3).delay(2), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_retry_stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::immediate(2);

        let result: Result<(), ReadError> = policy
            .retry(&CancellationFlag::new(), "always_fails", ReadError::is_transient, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(timeout("boom"))
            })
            .await;

        assert_eq!(result.unwrap_err(), timeout("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::immediate(5);

        let result: Result<(), ReadError> = policy
            .retry(&CancellationFlag::new(), "permanent", ReadError::is_transient, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ReadError::Permanent("revert".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let policy = BackoffPolicy::immediate(3);
        let result: Result<u32, ReadError> = policy
            .retry(&CancellationFlag::new(), "flaky", ReadError::is_transient, |attempt| async move {
                if attempt < 3 {
                    Err(timeout("timeout"))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cancel_stops_retries_between_attempts() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationFlag::new();
        let policy = BackoffPolicy::immediate(5);

        let result: Result<(), ReadError> = policy
            .retry(&cancel, "cancelled", ReadError::is_transient, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                cancel.cancel();
                Err(timeout("timeout"))
            })
            .await;

        assert_eq!(result.unwrap_err(), ReadError::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff_sleep() {
        let cancel = CancellationFlag::new();
        let policy = BackoffPolicy::new(5, Duration::from_secs(60), Duration::from_secs(60));
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<(), ReadError> = policy
            .retry(&cancel, "slow_backoff", ReadError::is_transient, |_| async {
                Err(timeout("timeout"))
            })
            .await;

        assert_eq!(result.unwrap_err(), ReadError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
