//! Mock adapters: deterministic synthesized upstreams.
//!
//! Kept bit-for-bit parallel to the live adapters so tests drive the whole
//! pipeline; only the upstream leg is synthesized. Behavior is adjustable at
//! runtime, which is how chaos runs flip routes between healthy and failing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;

use super::ToolAdapter;
use crate::{Error, Result};

/// Forced outcome overriding the failure fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOutcome {
    /// Always succeed
    Ok,
    /// Always fail retryably (upstream 5xx)
    Retryable,
    /// Always fail terminally (upstream 4xx)
    Terminal,
    /// Always time out
    Timeout,
}

/// Runtime-adjustable mock behavior.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Fraction of calls forced to a retryable failure (0.0 to 1.0),
    /// applied deterministically by call counter
    pub fail_fraction: f64,
    /// Artificial latency per call
    pub delay: std::time::Duration,
    /// Forced outcome; overrides `fail_fraction` when set
    pub force: Option<MockOutcome>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            fail_fraction: 0.0,
            delay: std::time::Duration::ZERO,
            force: None,
        }
    }
}

/// A synthesized upstream for one route.
pub struct MockAdapter {
    tool: String,
    action: String,
    behavior: Mutex<MockBehavior>,
    calls: AtomicU64,
}

impl MockAdapter {
    /// Create a mock for a route.
    #[must_use]
    pub fn new(tool: &str, action: &str, behavior: MockBehavior) -> Self {
        Self {
            tool: tool.to_string(),
            action: action.to_string(),
            behavior: Mutex::new(behavior),
            calls: AtomicU64::new(0),
        }
    }

    /// Replace the behavior (tests flip routes between failing and healthy).
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Total invocations so far.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Deterministic chaos: with fraction `f`, every `round(1/f)`-th call
    /// fails, starting with the first.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn chaos_fails(call_index: u64, fraction: f64) -> bool {
        if fraction <= 0.0 {
            return false;
        }
        if fraction >= 1.0 {
            return true;
        }
        let period = (1.0 / fraction).round().max(1.0) as u64;
        call_index % period == 0
    }
}

#[async_trait]
impl ToolAdapter for MockAdapter {
    async fn invoke(
        &self,
        action: &str,
        params: &Value,
        credential: &[u8],
        deadline: Instant,
    ) -> Result<Bytes> {
        let call_index = self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().clone();

        if !behavior.delay.is_zero() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if behavior.delay > remaining {
                tokio::time::sleep(remaining).await;
                return Err(Error::UpstreamTimeout(format!(
                    "{}:{} mock deadline overrun",
                    self.tool, self.action
                )));
            }
            tokio::time::sleep(behavior.delay).await;
        }

        let outcome = behavior.force.unwrap_or({
            if Self::chaos_fails(call_index, behavior.fail_fraction) {
                MockOutcome::Retryable
            } else {
                MockOutcome::Ok
            }
        });

        match outcome {
            MockOutcome::Ok => {
                let body = serde_json::json!({
                    "tool": self.tool,
                    "action": action,
                    "credential_bytes": credential.len(),
                    "echo": params,
                });
                Ok(Bytes::from(serde_json::to_vec(&body).map_err(|e| {
                    Error::Internal(format!("mock body encoding: {e}"))
                })?))
            }
            MockOutcome::Retryable => Err(Error::Upstream(format!(
                "{}:{} mock upstream 503",
                self.tool, self.action
            ))),
            MockOutcome::Terminal => Err(Error::UpstreamTerminal(format!(
                "{}:{} mock upstream 400",
                self.tool, self.action
            ))),
            MockOutcome::Timeout => Err(Error::UpstreamTimeout(format!(
                "{}:{} mock timeout",
                self.tool, self.action
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deadline() -> Instant {
        Instant::now() + std::time::Duration::from_secs(5)
    }

    #[tokio::test]
    async fn healthy_mock_echoes_params() {
        let mock = MockAdapter::new("serpapi", "search", MockBehavior::default());
        let bytes = mock
            .invoke("search", &json!({"q": "rust"}), b"sk-test", deadline())
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["tool"], "serpapi");
        assert_eq!(body["echo"]["q"], "rust");
        assert_eq!(body["credential_bytes"], 7);
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn forced_outcomes_map_to_error_classes() {
        let mock = MockAdapter::new("t", "a", MockBehavior::default());

        mock.set_behavior(MockBehavior {
            force: Some(MockOutcome::Retryable),
            ..MockBehavior::default()
        });
        assert!(matches!(
            mock.invoke("a", &json!({}), b"", deadline()).await,
            Err(Error::Upstream(_))
        ));

        mock.set_behavior(MockBehavior {
            force: Some(MockOutcome::Terminal),
            ..MockBehavior::default()
        });
        assert!(matches!(
            mock.invoke("a", &json!({}), b"", deadline()).await,
            Err(Error::UpstreamTerminal(_))
        ));

        mock.set_behavior(MockBehavior {
            force: Some(MockOutcome::Timeout),
            ..MockBehavior::default()
        });
        assert!(matches!(
            mock.invoke("a", &json!({}), b"", deadline()).await,
            Err(Error::UpstreamTimeout(_))
        ));
    }

    #[tokio::test]
    async fn delay_past_deadline_is_a_timeout() {
        let mock = MockAdapter::new("t", "a", MockBehavior {
            delay: std::time::Duration::from_millis(200),
            ..MockBehavior::default()
        });
        let tight = Instant::now() + std::time::Duration::from_millis(10);
        assert!(matches!(
            mock.invoke("a", &json!({}), b"", tight).await,
            Err(Error::UpstreamTimeout(_))
        ));
    }

    #[test]
    fn chaos_fraction_is_deterministic() {
        // 0.5 → every 2nd call fails, starting at call 0
        assert!(MockAdapter::chaos_fails(0, 0.5));
        assert!(!MockAdapter::chaos_fails(1, 0.5));
        assert!(MockAdapter::chaos_fails(2, 0.5));
        // 1.0 → every call fails
        assert!(MockAdapter::chaos_fails(3, 1.0));
        // 0.0 → never
        assert!(!MockAdapter::chaos_fails(0, 0.0));
    }
}
