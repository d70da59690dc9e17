//! Per-route circuit breakers.
//!
//! One breaker per (tool, action). Admission decisions and counter updates
//! happen under the same per-route lock, so the decision is race-free even
//! when observers read a briefly stale state.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::metrics::GatewayMetrics;
use crate::telemetry::{TelemetryEvent, TelemetryLog};
use crate::{Error, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Admitting requests
    Closed,
    /// Fast-failing requests
    Open,
    /// Admitting a single probe
    HalfOpen,
}

impl CircuitState {
    /// Lowercase label used in telemetry and error bodies.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: 0=closed, 1=open, 2=half-open.
    #[must_use]
    pub fn as_gauge(self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

/// Per-route breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Master switch
    pub enabled: bool,
    /// Failures within the window that trip the circuit
    pub failure_threshold: u32,
    /// Rolling window length, in request outcomes
    pub window_size: usize,
    /// How long the circuit stays open before allowing a probe
    #[serde(with = "humantime_serde")]
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            window_size: 10,
            open_duration: Duration::from_secs(30),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    /// Rolling outcome window, `true` = failure
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker for one (tool, action) route.
pub struct RouteBreaker {
    tool: String,
    action: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
    metrics: Arc<GatewayMetrics>,
    telemetry: Arc<TelemetryLog>,
}

impl RouteBreaker {
    /// Create a closed breaker for a route.
    #[must_use]
    pub fn new(
        tool: &str,
        action: &str,
        config: BreakerConfig,
        metrics: Arc<GatewayMetrics>,
        telemetry: Arc<TelemetryLog>,
    ) -> Self {
        metrics.set_breaker_state(tool, action, CircuitState::Closed.as_gauge());
        Self {
            tool: tool.to_string(),
            action: action.to_string(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
            metrics,
            telemetry,
        }
    }

    /// Decide whether to admit a request.
    ///
    /// Open circuits fast-fail with [`Error::BreakerOpen`] without invoking
    /// the adapter; an elapsed open timer transitions to half-open and
    /// admits exactly one probe.
    pub fn admit(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let mut guard = self.state.lock();
        match guard.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = guard.opened_at.map_or(Duration::ZERO, |at| at.elapsed());
                if elapsed >= self.config.open_duration {
                    self.transition(&mut guard, CircuitState::HalfOpen);
                    guard.probe_in_flight = true;
                    debug!(tool = %self.tool, action = %self.action, "Breaker admitting probe");
                    Ok(())
                } else {
                    self.fast_fail()
                }
            }
            CircuitState::HalfOpen => {
                if guard.probe_in_flight {
                    self.fast_fail()
                } else {
                    guard.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn fast_fail(&self) -> Result<()> {
        self.metrics
            .record_breaker_fastfail(&self.tool, &self.action);
        warn!(tool = %self.tool, action = %self.action, "Breaker fast-failing request");
        Err(Error::BreakerOpen {
            tool: self.tool.clone(),
            action: self.action.clone(),
        })
    }

    /// Record a successful completion.
    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }
        let mut guard = self.state.lock();
        match guard.state {
            CircuitState::Closed => {
                Self::push_outcome(&mut guard.window, false, self.config.window_size);
            }
            CircuitState::HalfOpen => {
                guard.probe_in_flight = false;
                self.transition(&mut guard, CircuitState::Closed);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed completion (upstream 5xx or timeout only; the caller
    /// filters out 4xx and policy outcomes).
    pub fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }
        let mut guard = self.state.lock();
        match guard.state {
            CircuitState::Closed => {
                Self::push_outcome(&mut guard.window, true, self.config.window_size);
                let failures = guard.window.iter().filter(|f| **f).count();
                if failures >= self.config.failure_threshold as usize {
                    self.transition(&mut guard, CircuitState::Open);
                    guard.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                guard.probe_in_flight = false;
                self.transition(&mut guard, CircuitState::Open);
                guard.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }
    }

    fn push_outcome(window: &mut VecDeque<bool>, failure: bool, size: usize) {
        window.push_back(failure);
        while window.len() > size.max(1) {
            window.pop_front();
        }
    }

    fn transition(&self, guard: &mut BreakerState, to: CircuitState) {
        let from = guard.state;
        if from == to {
            return;
        }
        guard.state = to;
        if to == CircuitState::Closed {
            guard.window.clear();
            guard.opened_at = None;
        }
        self.metrics
            .set_breaker_state(&self.tool, &self.action, to.as_gauge());
        self.telemetry.record(TelemetryEvent::breaker_transition(
            &self.tool,
            &self.action,
            from.as_str(),
            to.as_str(),
        ));
        match to {
            CircuitState::Open => warn!(tool = %self.tool, action = %self.action, "Circuit opened"),
            CircuitState::Closed => info!(tool = %self.tool, action = %self.action, "Circuit closed"),
            CircuitState::HalfOpen => {
                debug!(tool = %self.tool, action = %self.action, "Circuit half-open");
            }
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }
}

/// All route breakers, created lazily per (tool, action).
pub struct BreakerPool {
    default_config: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    routes: DashMap<String, Arc<RouteBreaker>>,
    metrics: Arc<GatewayMetrics>,
    telemetry: Arc<TelemetryLog>,
}

impl BreakerPool {
    /// Create a pool with a default config and per-route (`tool:action`)
    /// overrides.
    #[must_use]
    pub fn new(
        default_config: BreakerConfig,
        overrides: HashMap<String, BreakerConfig>,
        metrics: Arc<GatewayMetrics>,
        telemetry: Arc<TelemetryLog>,
    ) -> Self {
        Self {
            default_config,
            overrides,
            routes: DashMap::new(),
            metrics,
            telemetry,
        }
    }

    /// The breaker for a route, created on first use.
    #[must_use]
    pub fn route(&self, tool: &str, action: &str) -> Arc<RouteBreaker> {
        let key = format!("{tool}:{action}");
        self.routes
            .entry(key.clone())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| self.default_config.clone());
                Arc::new(RouteBreaker::new(
                    tool,
                    action,
                    config,
                    Arc::clone(&self.metrics),
                    Arc::clone(&self.telemetry),
                ))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(config: BreakerConfig) -> (RouteBreaker, Arc<GatewayMetrics>) {
        let metrics = Arc::new(GatewayMetrics::new());
        let breaker = RouteBreaker::new(
            "http_fetch",
            "get",
            config,
            Arc::clone(&metrics),
            Arc::new(TelemetryLog::new()),
        );
        (breaker, metrics)
    }

    fn config(threshold: u32, window: usize, open: Duration) -> BreakerConfig {
        BreakerConfig {
            enabled: true,
            failure_threshold: threshold,
            window_size: window,
            open_duration: open,
        }
    }

    #[test]
    fn trips_after_threshold_failures_in_window() {
        let (breaker, metrics) = breaker(config(5, 10, Duration::from_secs(30)));

        for _ in 0..4 {
            breaker.admit().unwrap();
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.admit().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Sixth request fast-fails without touching the adapter
        let err = breaker.admit().unwrap_err();
        assert!(matches!(err, Error::BreakerOpen { .. }));
        assert_eq!(metrics.breaker_fastfail_total("http_fetch", "get"), 1);
        assert_eq!(metrics.breaker_state("http_fetch", "get"), 1);
    }

    #[test]
    fn successes_age_failures_out_of_the_window() {
        let (breaker, _) = breaker(config(3, 3, Duration::from_secs(30)));

        breaker.record_failure();
        breaker.record_failure();
        // Window is [f, f]; a success pushes the window to [f, f, s]
        breaker.record_success();
        // Next failure evicts the oldest failure: [f, s, f] = 2 failures
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn open_transitions_to_half_open_after_duration() {
        let (breaker, _) = breaker(config(1, 10, Duration::ZERO));

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Zero open-duration: next admission is the probe
        breaker.admit().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Only one probe at a time
        assert!(breaker.admit().is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.admit().unwrap();
    }

    #[test]
    fn failed_probe_reopens() {
        let (breaker, _) = breaker(config(1, 10, Duration::ZERO));
        breaker.record_failure();
        breaker.admit().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn closed_circuit_resets_window() {
        let (breaker, _) = breaker(config(2, 10, Duration::ZERO));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.admit().unwrap();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);

        // One failure after reset is below threshold again
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn disabled_breaker_always_admits() {
        let (breaker, _) = breaker(BreakerConfig {
            enabled: false,
            ..config(1, 1, Duration::from_secs(30))
        });
        breaker.record_failure();
        breaker.record_failure();
        breaker.admit().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn pool_reuses_route_breakers_and_applies_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "http_fetch:get".to_string(),
            config(1, 1, Duration::from_secs(30)),
        );
        let pool = BreakerPool::new(
            BreakerConfig::default(),
            overrides,
            Arc::new(GatewayMetrics::new()),
            Arc::new(TelemetryLog::new()),
        );

        let a = pool.route("http_fetch", "get");
        let b = pool.route("http_fetch", "get");
        assert!(Arc::ptr_eq(&a, &b));

        // Override applies: a single failure trips this route
        a.record_failure();
        assert_eq!(a.state(), CircuitState::Open);

        // Default applies elsewhere
        let other = pool.route("serpapi", "search");
        other.record_failure();
        assert_eq!(other.state(), CircuitState::Closed);
    }
}
