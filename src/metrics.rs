//! Prometheus-compatible metrics registry.
//!
//! Counters, gauges, and histograms keyed by label values, rendered in the
//! Prometheus text exposition format by the `/metrics` endpoint. Increments
//! are lock-free: each labeled series is an atomic cell inside a concurrent
//! map, and histogram observations touch per-bucket atomics.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

/// Histogram buckets for request latency, in milliseconds.
pub const DURATION_BUCKETS_MS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0,
];

/// A counter family with a fixed label set.
struct CounterVec {
    name: &'static str,
    help: &'static str,
    label_names: &'static [&'static str],
    cells: DashMap<Vec<String>, AtomicU64>,
}

impl CounterVec {
    fn new(name: &'static str, help: &'static str, label_names: &'static [&'static str]) -> Self {
        Self {
            name,
            help,
            label_names,
            cells: DashMap::new(),
        }
    }

    fn inc(&self, labels: &[&str]) {
        debug_assert_eq!(labels.len(), self.label_names.len());
        let key: Vec<String> = labels.iter().map(ToString::to_string).collect();
        self.cells
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self, labels: &[&str]) -> u64 {
        let key: Vec<String> = labels.iter().map(ToString::to_string).collect();
        self.cells
            .get(&key)
            .map_or(0, |cell| cell.load(Ordering::Relaxed))
    }

    fn render(&self, out: &mut String) {
        render_header(out, self.name, self.help, "counter");
        let mut series = sorted_series(&self.cells, |c| c.load(Ordering::Relaxed));
        for (labels, value) in series.drain(..) {
            out.push_str(self.name);
            render_labels(out, self.label_names, &labels);
            out.push(' ');
            out.push_str(&value.to_string());
            out.push('\n');
        }
    }
}

/// A gauge family with a fixed label set.
struct GaugeVec {
    name: &'static str,
    help: &'static str,
    label_names: &'static [&'static str],
    cells: DashMap<Vec<String>, AtomicI64>,
}

impl GaugeVec {
    fn new(name: &'static str, help: &'static str, label_names: &'static [&'static str]) -> Self {
        Self {
            name,
            help,
            label_names,
            cells: DashMap::new(),
        }
    }

    fn set(&self, labels: &[&str], value: i64) {
        debug_assert_eq!(labels.len(), self.label_names.len());
        let key: Vec<String> = labels.iter().map(ToString::to_string).collect();
        self.cells
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    fn get(&self, labels: &[&str]) -> i64 {
        let key: Vec<String> = labels.iter().map(ToString::to_string).collect();
        self.cells
            .get(&key)
            .map_or(0, |cell| cell.load(Ordering::Relaxed))
    }

    fn render(&self, out: &mut String) {
        render_header(out, self.name, self.help, "gauge");
        let mut series = sorted_series(&self.cells, |c| c.load(Ordering::Relaxed));
        for (labels, value) in series.drain(..) {
            out.push_str(self.name);
            render_labels(out, self.label_names, &labels);
            out.push(' ');
            out.push_str(&value.to_string());
            out.push('\n');
        }
    }
}

/// Per-series histogram state: one atomic per bucket plus sum and count.
struct HistogramCell {
    /// Non-cumulative per-bucket counts; cumulated at render time
    buckets: Vec<AtomicU64>,
    /// Sum of observations in microseconds (atomic-friendly integer)
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl HistogramCell {
    fn new(bucket_count: usize) -> Self {
        Self {
            buckets: (0..=bucket_count).map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }
}

/// A histogram family with a fixed label set and fixed buckets.
struct HistogramVec {
    name: &'static str,
    help: &'static str,
    label_names: &'static [&'static str],
    bucket_bounds: &'static [f64],
    cells: DashMap<Vec<String>, HistogramCell>,
}

impl HistogramVec {
    fn new(
        name: &'static str,
        help: &'static str,
        label_names: &'static [&'static str],
        bucket_bounds: &'static [f64],
    ) -> Self {
        Self {
            name,
            help,
            label_names,
            bucket_bounds,
            cells: DashMap::new(),
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn observe(&self, labels: &[&str], value_ms: f64) {
        debug_assert_eq!(labels.len(), self.label_names.len());
        let key: Vec<String> = labels.iter().map(ToString::to_string).collect();
        let cell = self
            .cells
            .entry(key)
            .or_insert_with(|| HistogramCell::new(self.bucket_bounds.len()));

        let idx = self
            .bucket_bounds
            .iter()
            .position(|bound| value_ms <= *bound)
            .unwrap_or(self.bucket_bounds.len());
        cell.buckets[idx].fetch_add(1, Ordering::Relaxed);
        cell.sum_micros
            .fetch_add((value_ms.max(0.0) * 1000.0) as u64, Ordering::Relaxed);
        cell.count.fetch_add(1, Ordering::Relaxed);
    }

    fn count(&self, labels: &[&str]) -> u64 {
        let key: Vec<String> = labels.iter().map(ToString::to_string).collect();
        self.cells
            .get(&key)
            .map_or(0, |cell| cell.count.load(Ordering::Relaxed))
    }

    #[allow(clippy::cast_precision_loss)]
    fn render(&self, out: &mut String) {
        render_header(out, self.name, self.help, "histogram");
        let mut keys: Vec<Vec<String>> = self.cells.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        for labels in keys {
            let Some(cell) = self.cells.get(&labels) else { continue };
            let mut cumulative = 0u64;
            for (idx, bound) in self.bucket_bounds.iter().enumerate() {
                cumulative += cell.buckets[idx].load(Ordering::Relaxed);
                out.push_str(self.name);
                out.push_str("_bucket");
                render_labels_with_le(out, self.label_names, &labels, &format_bound(*bound));
                out.push(' ');
                out.push_str(&cumulative.to_string());
                out.push('\n');
            }
            cumulative += cell.buckets[self.bucket_bounds.len()].load(Ordering::Relaxed);
            out.push_str(self.name);
            out.push_str("_bucket");
            render_labels_with_le(out, self.label_names, &labels, "+Inf");
            out.push(' ');
            out.push_str(&cumulative.to_string());
            out.push('\n');

            let sum_ms = cell.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0;
            out.push_str(self.name);
            out.push_str("_sum");
            render_labels(out, self.label_names, &labels);
            out.push(' ');
            out.push_str(&format!("{sum_ms}"));
            out.push('\n');

            out.push_str(self.name);
            out.push_str("_count");
            render_labels(out, self.label_names, &labels);
            out.push(' ');
            out.push_str(&cell.count.load(Ordering::Relaxed).to_string());
            out.push('\n');
        }
    }
}

fn render_header(out: &mut String, name: &str, help: &str, kind: &str) {
    out.push_str("# HELP ");
    out.push_str(name);
    out.push(' ');
    out.push_str(help);
    out.push('\n');
    out.push_str("# TYPE ");
    out.push_str(name);
    out.push(' ');
    out.push_str(kind);
    out.push('\n');
}

fn render_labels(out: &mut String, names: &[&str], values: &[String]) {
    if names.is_empty() {
        return;
    }
    out.push('{');
    for (i, (name, value)) in names.iter().zip(values).enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(&escape_label(value));
        out.push('"');
    }
    out.push('}');
}

fn render_labels_with_le(out: &mut String, names: &[&str], values: &[String], le: &str) {
    out.push('{');
    for (name, value) in names.iter().zip(values) {
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(&escape_label(value));
        out.push_str("\",");
    }
    out.push_str("le=\"");
    out.push_str(le);
    out.push_str("\"}");
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn format_bound(bound: f64) -> String {
    if bound.fract() == 0.0 {
        format!("{}", bound as i64)
    } else {
        format!("{bound}")
    }
}

fn sorted_series<V, T: Ord>(
    cells: &DashMap<Vec<String>, V>,
    load: impl Fn(&V) -> T,
) -> Vec<(Vec<String>, T)> {
    let mut series: Vec<(Vec<String>, T)> = cells
        .iter()
        .map(|entry| (entry.key().clone(), load(entry.value())))
        .collect();
    series.sort_by(|a, b| a.0.cmp(&b.0));
    series
}

/// The gateway's metric families.
///
/// One instance per process, created at startup and passed by handle; every
/// component records through typed methods rather than stringly family names.
pub struct GatewayMetrics {
    requests_total: CounterVec,
    request_duration_ms: HistogramVec,
    cache_hits_total: CounterVec,
    retries_total: CounterVec,
    breaker_fastfail_total: CounterVec,
    breaker_state: GaugeVec,
    policy_denials_total: CounterVec,
    token_generations_total: CounterVec,
    token_validations_total: CounterVec,
    token_expirations_total: CounterVec,
    cache_entries: GaugeVec,
    process_start_time_seconds: f64,
}

impl GatewayMetrics {
    /// Create the registry with all families declared and the process start
    /// time stamped.
    #[must_use]
    pub fn new() -> Self {
        #[allow(clippy::cast_precision_loss)]
        let start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Self {
            requests_total: CounterVec::new(
                "gateway_requests_total",
                "Proxied requests by terminal status code",
                &["tool", "action", "code"],
            ),
            request_duration_ms: HistogramVec::new(
                "gateway_request_duration_ms",
                "End-to-end proxy request latency in milliseconds",
                &["tool", "action"],
                DURATION_BUCKETS_MS,
            ),
            cache_hits_total: CounterVec::new(
                "gateway_cache_hits_total",
                "Responses served from the fingerprint cache",
                &["tool", "action"],
            ),
            retries_total: CounterVec::new(
                "gateway_retries_total",
                "Retry attempts by failure reason",
                &["tool", "action", "reason"],
            ),
            breaker_fastfail_total: CounterVec::new(
                "gateway_breaker_fastfail_total",
                "Requests rejected by an open circuit breaker",
                &["tool", "action"],
            ),
            breaker_state: GaugeVec::new(
                "gateway_breaker_state",
                "Circuit state per route (0=closed, 1=open, 2=half-open)",
                &["tool", "action"],
            ),
            policy_denials_total: CounterVec::new(
                "gateway_policy_denials_total",
                "Policy engine denials by reason",
                &["agent_id", "tool", "action", "reason"],
            ),
            token_generations_total: CounterVec::new(
                "gateway_token_generations_total",
                "Tokens minted per agent",
                &["agent_id"],
            ),
            token_validations_total: CounterVec::new(
                "gateway_token_validations_total",
                "Token validation attempts per agent and outcome",
                &["agent_id", "success"],
            ),
            token_expirations_total: CounterVec::new(
                "gateway_token_expirations_total",
                "Tokens rejected because their TTL elapsed",
                &["agent_id"],
            ),
            cache_entries: GaugeVec::new(
                "gateway_cache_entries",
                "Live entries in the response cache",
                &[],
            ),
            process_start_time_seconds: start,
        }
    }

    /// Record a terminal proxy outcome with its latency observation.
    pub fn record_request(&self, tool: &str, action: &str, code: u16, duration_ms: f64) {
        self.requests_total
            .inc(&[tool, action, &code.to_string()]);
        self.request_duration_ms.observe(&[tool, action], duration_ms);
    }

    /// Record a direct cache hit.
    pub fn record_cache_hit(&self, tool: &str, action: &str) {
        self.cache_hits_total.inc(&[tool, action]);
    }

    /// Record one retry attempt.
    pub fn record_retry(&self, tool: &str, action: &str, reason: &str) {
        self.retries_total.inc(&[tool, action, reason]);
    }

    /// Record a breaker fast-fail.
    pub fn record_breaker_fastfail(&self, tool: &str, action: &str) {
        self.breaker_fastfail_total.inc(&[tool, action]);
    }

    /// Publish the current breaker state for a route.
    pub fn set_breaker_state(&self, tool: &str, action: &str, state: i64) {
        self.breaker_state.set(&[tool, action], state);
    }

    /// Record a non-allow policy outcome.
    pub fn record_policy_denial(&self, agent_id: &str, tool: &str, action: &str, reason: &str) {
        self.policy_denials_total.inc(&[agent_id, tool, action, reason]);
    }

    /// Record a token mint.
    pub fn record_token_generation(&self, agent_id: &str) {
        self.token_generations_total.inc(&[agent_id]);
    }

    /// Record a token validation attempt.
    pub fn record_token_validation(&self, agent_id: &str, success: bool) {
        self.token_validations_total
            .inc(&[agent_id, if success { "true" } else { "false" }]);
    }

    /// Record a token rejected for expiry.
    pub fn record_token_expiration(&self, agent_id: &str) {
        self.token_expirations_total.inc(&[agent_id]);
    }

    /// Publish the current cache entry count.
    pub fn set_cache_entries(&self, entries: i64) {
        self.cache_entries.set(&[], entries);
    }

    /// Current value of `gateway_requests_total` for a label combination.
    #[must_use]
    pub fn requests_total(&self, tool: &str, action: &str, code: u16) -> u64 {
        self.requests_total.get(&[tool, action, &code.to_string()])
    }

    /// Current value of `gateway_cache_hits_total` for a route.
    #[must_use]
    pub fn cache_hits_total(&self, tool: &str, action: &str) -> u64 {
        self.cache_hits_total.get(&[tool, action])
    }

    /// Current value of `gateway_retries_total` for a route and reason.
    #[must_use]
    pub fn retries_total(&self, tool: &str, action: &str, reason: &str) -> u64 {
        self.retries_total.get(&[tool, action, reason])
    }

    /// Current value of `gateway_breaker_fastfail_total` for a route.
    #[must_use]
    pub fn breaker_fastfail_total(&self, tool: &str, action: &str) -> u64 {
        self.breaker_fastfail_total.get(&[tool, action])
    }

    /// Current value of `gateway_breaker_state` for a route.
    #[must_use]
    pub fn breaker_state(&self, tool: &str, action: &str) -> i64 {
        self.breaker_state.get(&[tool, action])
    }

    /// Current value of `gateway_policy_denials_total` for a label combination.
    #[must_use]
    pub fn policy_denials_total(&self, agent_id: &str, tool: &str, action: &str, reason: &str) -> u64 {
        self.policy_denials_total.get(&[agent_id, tool, action, reason])
    }

    /// Current value of `gateway_token_generations_total` for an agent.
    #[must_use]
    pub fn token_generations_total(&self, agent_id: &str) -> u64 {
        self.token_generations_total.get(&[agent_id])
    }

    /// Current value of `gateway_token_validations_total` for an agent/outcome.
    #[must_use]
    pub fn token_validations_total(&self, agent_id: &str, success: bool) -> u64 {
        self.token_validations_total
            .get(&[agent_id, if success { "true" } else { "false" }])
    }

    /// Current value of `gateway_token_expirations_total` for an agent.
    #[must_use]
    pub fn token_expirations_total(&self, agent_id: &str) -> u64 {
        self.token_expirations_total.get(&[agent_id])
    }

    /// Observation count of `gateway_request_duration_ms` for a route.
    #[must_use]
    pub fn request_duration_count(&self, tool: &str, action: &str) -> u64 {
        self.request_duration_ms.count(&[tool, action])
    }

    /// Render every family in the Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(4096);
        self.requests_total.render(&mut out);
        self.request_duration_ms.render(&mut out);
        self.cache_hits_total.render(&mut out);
        self.retries_total.render(&mut out);
        self.breaker_fastfail_total.render(&mut out);
        self.breaker_state.render(&mut out);
        self.policy_denials_total.render(&mut out);
        self.token_generations_total.render(&mut out);
        self.token_validations_total.render(&mut out);
        self.token_expirations_total.render(&mut out);
        self.cache_entries.render(&mut out);
        render_header(
            &mut out,
            "gateway_process_start_time_seconds",
            "Unix time the gateway process started",
            "gauge",
        );
        out.push_str(&format!(
            "gateway_process_start_time_seconds {}\n",
            self.process_start_time_seconds
        ));
        out
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
