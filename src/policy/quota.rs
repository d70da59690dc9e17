//! Sliding-window quota counters.
//!
//! Two adjacent fixed windows with linear interpolation: the estimated rate
//! is `previous * (1 - elapsed_fraction) + current`. Cheaper than an exact
//! token bucket and accurate enough for per-agent tool quotas. Keys are
//! `(agent, tool, action)` strings; a low-rate sweeper drops keys that have
//! been idle for two full windows.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

/// Counter state for one quota key.
struct WindowPair {
    /// Index of the current fixed window (`now / window_secs`)
    window_index: i64,
    /// Window length this key is tracked at
    window_secs: i64,
    /// Count in the current window
    current: u64,
    /// Count in the immediately preceding window
    previous: u64,
}

/// Sliding-window counters keyed by `(agent, tool, action)`.
pub struct QuotaTracker {
    windows: DashMap<String, WindowPair>,
}

impl QuotaTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Check the quota for `key` and, when admitted, count the request.
    ///
    /// Returns `false` (without counting) when the interpolated rate has
    /// reached `limit` within `window_secs`.
    pub fn check_and_increment(&self, key: &str, limit: u64, window_secs: u64, now: i64) -> bool {
        let window_secs = i64::try_from(window_secs.max(1)).unwrap_or(i64::MAX);
        let index = now.div_euclid(window_secs);

        let mut pair = self.windows.entry(key.to_string()).or_insert(WindowPair {
            window_index: index,
            window_secs,
            current: 0,
            previous: 0,
        });

        // Roll the windows forward if time moved on.
        if index == pair.window_index + 1 {
            pair.previous = pair.current;
            pair.current = 0;
            pair.window_index = index;
        } else if index != pair.window_index {
            pair.previous = 0;
            pair.current = 0;
            pair.window_index = index;
        }
        pair.window_secs = window_secs;

        #[allow(clippy::cast_precision_loss)]
        let elapsed_fraction =
            (now.rem_euclid(window_secs)) as f64 / window_secs as f64;
        #[allow(clippy::cast_precision_loss)]
        let estimated = pair.previous as f64 * (1.0 - elapsed_fraction) + pair.current as f64;
        #[allow(clippy::cast_precision_loss)]
        let over = estimated + 1.0 > limit as f64;

        if over {
            return false;
        }
        pair.current += 1;
        true
    }

    /// Drop keys idle for at least two full windows.
    pub fn sweep(&self, now: i64) {
        let stale: Vec<String> = self
            .windows
            .iter()
            .filter(|entry| {
                let pair = entry.value();
                now.div_euclid(pair.window_secs) > pair.window_index + 1
            })
            .map(|entry| entry.key().clone())
            .collect();
        let count = stale.len();
        for key in stale {
            self.windows.remove(&key);
        }
        if count > 0 {
            debug!(count, "Swept idle quota keys");
        }
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no keys are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the periodic quota sweeper; exits when `shutdown` fires.
pub fn spawn_sweeper(
    tracker: Arc<QuotaTracker>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => tracker.sweep(chrono::Utc::now().timestamp()),
                _ = shutdown.recv() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_limit_within_one_window() {
        let tracker = QuotaTracker::new();
        // Start of a window: previous contributes nothing
        let now = 60;
        for _ in 0..5 {
            assert!(tracker.check_and_increment("k", 5, 60, now));
        }
        assert!(!tracker.check_and_increment("k", 5, 60, now));
    }

    #[test]
    fn denied_requests_are_not_counted() {
        let tracker = QuotaTracker::new();
        let now = 60;
        assert!(tracker.check_and_increment("k", 1, 60, now));
        assert!(!tracker.check_and_increment("k", 1, 60, now));
        // A full window later the key admits again; the denials above did
        // not inflate the previous-window count past the limit
        assert!(tracker.check_and_increment("k", 1, 60, now + 120));
    }

    #[test]
    fn previous_window_interpolates_into_current() {
        let tracker = QuotaTracker::new();
        // Fill the window starting at t=60
        for _ in 0..4 {
            assert!(tracker.check_and_increment("k", 4, 60, 60));
        }
        // Immediately after the boundary the previous window still counts
        // almost fully: 4 * (1 - 0/60) + 0 + 1 > 4
        assert!(!tracker.check_and_increment("k", 4, 60, 120));
        // Halfway through, previous contributes 2; 2 + 1 <= 4 admits
        assert!(tracker.check_and_increment("k", 4, 60, 150));
    }

    #[test]
    fn long_idle_resets_both_windows() {
        let tracker = QuotaTracker::new();
        for _ in 0..3 {
            assert!(tracker.check_and_increment("k", 3, 60, 60));
        }
        assert!(tracker.check_and_increment("k", 3, 60, 60 + 600));
    }

    #[test]
    fn keys_are_independent() {
        let tracker = QuotaTracker::new();
        assert!(tracker.check_and_increment("a", 1, 60, 60));
        assert!(!tracker.check_and_increment("a", 1, 60, 60));
        assert!(tracker.check_and_increment("b", 1, 60, 60));
    }

    #[test]
    fn sweep_drops_idle_keys_only() {
        let tracker = QuotaTracker::new();
        tracker.check_and_increment("old", 5, 60, 60);
        tracker.check_and_increment("fresh", 5, 60, 600);
        tracker.sweep(600);
        assert_eq!(tracker.len(), 1);
    }
}
