// src/retry.rs
//
// Exponential backoff with jitter, shared by the transport workers and the
// slot-request / close API calls.

use crate::constants::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_RETRY_JITTER,
    DEFAULT_RETRY_MAX_DELAY_MS,
};
use crate::error::Result;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum attempts per operation, first try included. Must be >= 1.
    pub max_attempts: u32,
    /// Base delay before the first retry
    pub base_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Jitter factor (0.0 to 1.0) applied on top of the capped delay
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            jitter: DEFAULT_RETRY_JITTER,
        }
    }
}

impl RetryConfig {
    /// Delay before the retry that follows failed attempt number
    /// `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let exponential = self
            .base_delay
            .as_millis()
            .saturating_mul(1u128 << shift)
            .min(self.max_delay.as_millis()) as u64;

        let jitter_range = (exponential as f64 * self.jitter) as u64;
        let jitter = if jitter_range > 0 {
            rand::rng().random_range(0..=jitter_range)
        } else {
            0
        };
        Duration::from_millis(exponential.saturating_add(jitter))
    }
}

/// Run an async operation, retrying retryable failures with backoff.
///
/// Used for the idempotent API calls (slot request, close). The worker pool
/// carries its own loop because it records per-attempt state transitions.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, what: &str, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < config.max_attempts => {
                let delay = config.delay_for(attempt);
                tracing::warn!(
                    what,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "operation failed, retrying"
                );
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UploadError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            jitter: 0.0,
        }
    }

    #[test]
    fn delays_double_then_cap() {
        let cfg = no_jitter();
        assert_eq!(cfg.delay_for(1), Duration::from_millis(100));
        assert_eq!(cfg.delay_for(2), Duration::from_millis(200));
        assert_eq!(cfg.delay_for(3), Duration::from_millis(400));
        assert_eq!(cfg.delay_for(10), Duration::from_millis(400));
    }

    #[test]
    fn jitter_stays_within_factor() {
        let cfg = RetryConfig {
            jitter: 0.5,
            ..no_jitter()
        };
        for _ in 0..100 {
            let d = cfg.delay_for(1);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let cfg = RetryConfig {
            base_delay: Duration::from_millis(1),
            ..no_jitter()
        };
        let calls = AtomicU32::new(0);
        let out = with_retry(&cfg, "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(UploadError::transport("blip"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_after_attempt_cap() {
        let cfg = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            ..no_jitter()
        };
        let calls = AtomicU32::new(0);
        let out: Result<()> = with_retry(&cfg, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(UploadError::transport("always"))
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let cfg = no_jitter();
        let calls = AtomicU32::new(0);
        let out: Result<()> = with_retry(&cfg, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(UploadError::configuration("bad"))
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
