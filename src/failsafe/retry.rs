//! Retry with bounded exponential backoff and full jitter.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::RngExt;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Master switch
    pub enabled: bool,
    /// Maximum attempts including the first
    pub max_attempts: u32,
    /// Initial backoff interval
    #[serde(with = "humantime_serde")]
    pub base: Duration,
    /// Backoff multiplier per attempt
    pub factor: f64,
    /// Backoff ceiling
    #[serde(with = "humantime_serde")]
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base: Duration::from_millis(100),
            factor: 2.0,
            cap: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Full-jitter delay before the attempt after `completed_attempts`
    /// failures: uniform in `[0, min(cap, base * factor^(n-1))]`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
    pub fn backoff_delay(&self, completed_attempts: u32) -> Duration {
        let exp = completed_attempts.saturating_sub(1);
        let ceiling_ms = (self.base.as_millis() as f64 * self.factor.powi(exp as i32))
            .min(self.cap.as_millis() as f64) as u64;
        Duration::from_millis(rand::rng().random_range(0..=ceiling_ms))
    }
}

/// Execute `f` with retries over retryable error classes.
///
/// Retries stop when the error is not retryable, `max_attempts` is reached,
/// or the next backoff would overrun `deadline`. `on_retry` fires once per
/// retry (not per attempt) with the error that caused it, before sleeping.
///
/// # Errors
///
/// Returns the last error from `f`.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    deadline: Instant,
    operation: &str,
    mut on_retry: impl FnMut(&Error),
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if !policy.enabled {
        return f().await;
    }

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !e.is_retryable() {
                    return Err(e);
                }
                if attempts >= policy.max_attempts {
                    debug!(operation, attempts, "Max retry attempts reached");
                    return Err(e);
                }
                let delay = policy.backoff_delay(attempts);
                if Instant::now() + delay >= deadline {
                    debug!(operation, attempts, "Deadline leaves no room for another attempt");
                    return Err(e);
                }
                on_retry(&e);
                debug!(
                    operation,
                    attempt = attempts,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "Retrying after backoff"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            enabled: true,
            max_attempts: 3,
            base: Duration::from_millis(1),
            factor: 2.0,
            cap: Duration::from_millis(4),
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let result: Result<u32> = with_retry(
            &fast_policy(),
            far_deadline(),
            "op",
            |_| {},
            move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_retryable_errors_up_to_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let retries_clone = Arc::clone(&retries);
        let result: Result<()> = with_retry(
            &fast_policy(),
            far_deadline(),
            "op",
            move |_| {
                retries_clone.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Upstream("503".into()))
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let result: Result<&'static str> = with_retry(
            &fast_policy(),
            far_deadline(),
            "op",
            |_| {},
            move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::UpstreamTimeout("slow".into()))
                    } else {
                        Ok("recovered")
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let result: Result<()> = with_retry(
            &fast_policy(),
            far_deadline(),
            "op",
            |_| {},
            move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::UpstreamTerminal("400".into()))
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deadline_stops_further_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        // Deadline already effectively here: no backoff fits
        let result: Result<()> = with_retry(
            &fast_policy(),
            Instant::now(),
            "op",
            |_| {},
            move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Upstream("503".into()))
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_policy_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let policy = RetryPolicy {
            enabled: false,
            ..fast_policy()
        };
        let result: Result<()> = with_retry(
            &policy,
            far_deadline(),
            "op",
            |_| {},
            move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Upstream("503".into()))
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_delay_is_bounded_by_cap() {
        let policy = RetryPolicy::default();
        for attempt in 1..8 {
            let delay = policy.backoff_delay(attempt);
            assert!(delay <= policy.cap, "attempt {attempt} delay {delay:?}");
        }
    }
}
