//! Retry schedules for transient failures
//!
//! Reads against the document store and the callables are retried when the
//! error is transient ([`ClientError::is_retryable`](crate::ClientError::is_retryable)).
//! Writes are never retried here; the reconciliation layer decides what to
//! do after a failed write.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

/// Backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor per retry
    pub multiplier: f64,
    /// Add up to 25% random delay
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait `delay` before each of `max_attempts` retries.
    #[must_use]
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            add_jitter: false,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, enable: bool) -> Self {
        self.add_jitter = enable;
        self
    }

    /// Delay before retry number `retry` (zero-based).
    #[must_use]
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let delay = backoff_delay(self.base_delay, self.multiplier, self.max_delay, retry);
        if !self.add_jitter {
            return delay;
        }

        let spread = u128::try_from(delay.as_millis() / 4).unwrap_or(u128::MAX);
        if spread == 0 {
            return delay;
        }
        let extra = uuid::Uuid::new_v4().as_u128() % spread;
        delay + Duration::from_millis(u64::try_from(extra).unwrap_or(u64::MAX))
    }
}

/// `min(base * multiplier^attempt, max)`, saturating instead of overflowing.
///
/// Multipliers below 1 are treated as 1.
#[must_use]
pub fn backoff_delay(base: Duration, multiplier: f64, max: Duration, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let delay_ms = base.as_millis() as f64 * multiplier.max(1.0).powi(exponent);

    if !delay_ms.is_finite() || delay_ms >= max.as_millis() as f64 {
        max
    } else {
        Duration::from_millis(delay_ms.round() as u64)
    }
}

/// Errors that know whether a retry may succeed.
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

impl RetryableError for crate::ClientError {
    fn is_retryable(&self) -> bool {
        crate::ClientError::is_retryable(self)
    }
}

/// Run `operation`, retrying transient errors on `config`'s schedule.
///
/// Returns the first success, the first non-retryable error, or the last
/// error once the retries are used up.
pub async fn with_retry<F, Fut, T, E>(config: RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let mut retry = 0;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if retry >= config.max_attempts || !err.is_retryable() {
            return Err(err);
        }

        let delay = config.delay_for_attempt(retry);
        warn!(
            attempt = retry + 1,
            max_attempts = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after transient error"
        );
        sleep(delay).await;
        retry += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky(bool);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky (retryable: {})", self.0)
        }
    }

    impl RetryableError for Flaky {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn test_schedule_grows_and_caps() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(false);

        let delays: Vec<_> = (0..5).map(|n| config.delay_for_attempt(n).as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 5, 5]);
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let config = RetryConfig::new().with_base_delay(Duration::from_millis(400));
        for _ in 0..50 {
            let delay = config.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay < Duration::from_millis(500));
        }
    }

    #[test]
    fn test_fixed_schedule_is_flat() {
        let config = RetryConfig::fixed(2, Duration::from_millis(250));
        assert!((0..4).all(|n| config.delay_for_attempt(n) == Duration::from_millis(250)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors_until_exhausted() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(RetryConfig::fixed(2, Duration::from_secs(1)), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Flaky(true)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(RetryConfig::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Flaky(false)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_error() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::fixed(3, Duration::from_millis(1));

        let result = with_retry(config, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Flaky(true))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
    }
}
