//! The proxy pipeline: authenticate → authorize → cache → breaker → retry →
//! adapter → shape → metrics.
//!
//! Each request is a self-contained unit of work; the cache, breakers,
//! metrics, secrets, and policy counters are the only shared surfaces, each
//! synchronized at its own boundary. At-most-once per fingerprint
//! concurrently building is enforced by the cache's single-flight; adapter
//! concurrency is bounded by a per-tool semaphore that rejects with 429
//! before the breaker is ever consulted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tracing::debug;
use uuid::Uuid;

use super::fingerprint::fingerprint;
use crate::adapter::AdapterRegistry;
use crate::cache::{FingerprintCache, Lookup};
use crate::failsafe::{BreakerPool, RetryPolicy, with_retry};
use crate::metrics::GatewayMetrics;
use crate::policy::{Decision, PolicyEngine, PolicyRequest, ResponseShaping};
use crate::secrets::SecretsStore;
use crate::telemetry::TelemetryLog;
use crate::token::TokenService;
use crate::{Error, Result};

/// Runtime feature toggles (`FF_*` environment variables).
#[derive(Debug, Clone, Copy)]
pub struct FeatureFlags {
    /// Response cache + single-flight
    pub cache: bool,
    /// Retry loop
    pub retry: bool,
    /// Circuit breakers
    pub breakers: bool,
    /// Policy engine (authorization still requires a valid token)
    pub policy: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            cache: true,
            retry: true,
            breakers: true,
            policy: true,
        }
    }
}

/// Pipeline tuning derived from configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Feature toggles
    pub flags: FeatureFlags,
    /// Per-attempt upstream timeout
    pub attempt_timeout: Duration,
    /// Per-tool ceiling on total request time
    pub total_deadline: Duration,
    /// Default cache TTL
    pub cache_ttl: Duration,
    /// Per-tool cache TTL overrides
    pub tool_cache_ttls: HashMap<String, Duration>,
    /// Per-tool concurrent adapter call bound
    pub max_concurrency: usize,
    /// Retry schedule
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flags: FeatureFlags::default(),
            attempt_timeout: Duration::from_secs(10),
            total_deadline: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(60),
            tool_cache_ttls: HashMap::new(),
            max_concurrency: 64,
            retry: RetryPolicy::default(),
        }
    }
}

/// An incoming tool invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyRequest {
    /// Opaque wire token
    pub agent_token: String,
    /// Tool id
    pub tool: String,
    /// Action id
    pub action: String,
    /// Opaque parameters passed through to the adapter
    #[serde(default)]
    pub params: Value,
}

/// The terminal outcome of a proxied request.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    /// Terminal HTTP status (200, 401, 403, 429, 502, 503, 504)
    pub status: u16,
    /// Response body (upstream bytes or an opaque error body)
    pub body: Bytes,
    /// Correlation id assigned to the request
    pub correlation_id: String,
}

/// The orchestrator over every core subsystem.
pub struct ProxyPipeline {
    tokens: Arc<TokenService>,
    policy: Arc<PolicyEngine>,
    cache: Arc<FingerprintCache>,
    breakers: Arc<BreakerPool>,
    secrets: Arc<SecretsStore>,
    adapters: Arc<AdapterRegistry>,
    metrics: Arc<GatewayMetrics>,
    #[allow(dead_code)]
    telemetry: Arc<TelemetryLog>,
    config: PipelineConfig,
    semaphores: DashMap<String, Arc<Semaphore>>,
}

impl ProxyPipeline {
    /// Wire the pipeline to its collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tokens: Arc<TokenService>,
        policy: Arc<PolicyEngine>,
        cache: Arc<FingerprintCache>,
        breakers: Arc<BreakerPool>,
        secrets: Arc<SecretsStore>,
        adapters: Arc<AdapterRegistry>,
        metrics: Arc<GatewayMetrics>,
        telemetry: Arc<TelemetryLog>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            tokens,
            policy,
            cache,
            breakers,
            secrets,
            adapters,
            metrics,
            telemetry,
            config,
            semaphores: DashMap::new(),
        }
    }

    /// Handle one request to a terminal state.
    ///
    /// `caller_deadline` bounds total time together with the configured
    /// per-tool ceiling; the effective deadline is the earlier of the two.
    pub async fn handle(
        &self,
        request: ProxyRequest,
        caller_deadline: Option<Instant>,
    ) -> ProxyResponse {
        let correlation_id = Uuid::new_v4().to_string();
        let start = Instant::now();

        let result = self.execute(&request, &correlation_id, caller_deadline).await;
        let (status, body) = match result {
            Ok(bytes) => (200, bytes),
            Err(e) => {
                // Unknown agents/tokens/credentials collapse to the opaque
                // 401 on the data path (no enumeration oracle).
                let status = match &e {
                    Error::NotFound(_) => 401,
                    _ => e.http_status(),
                };
                (status, error_body(status, &e))
            }
        };

        #[allow(clippy::cast_precision_loss)]
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .record_request(&request.tool, &request.action, status, elapsed_ms);
        debug!(
            correlation_id = %correlation_id,
            tool = %request.tool,
            action = %request.action,
            status,
            elapsed_ms,
            "Proxy request complete"
        );

        ProxyResponse {
            status,
            body,
            correlation_id,
        }
    }

    async fn execute(
        &self,
        request: &ProxyRequest,
        correlation_id: &str,
        caller_deadline: Option<Instant>,
    ) -> Result<Bytes> {
        // Authenticate
        let valid = self.tokens.validate(&request.agent_token, correlation_id)?;

        // Authorize
        let shaping = if self.config.flags.policy {
            let policy_request = PolicyRequest {
                agent_id: valid.agent_id,
                role: &valid.agent_role,
                scope: &valid.scope,
                tool: &request.tool,
                action: &request.action,
                params: &request.params,
            };
            match self.policy.evaluate(&policy_request, correlation_id) {
                Decision::Allow { shaping } => shaping,
                Decision::Deny { reason } if reason == "quota" => {
                    return Err(Error::QuotaExceeded(reason));
                }
                Decision::Deny { reason } | Decision::RequireApproval { reason } => {
                    return Err(Error::PolicyDeny { reason });
                }
            }
        } else {
            None
        };

        // Fingerprint
        let fp = fingerprint(
            &request.tool,
            &request.action,
            &request.params,
            &valid.scope.digest(),
        );

        // Deadline: min(caller deadline, per-tool ceiling)
        let ceiling = Instant::now() + self.config.total_deadline;
        let deadline = caller_deadline.map_or(ceiling, |d| d.min(ceiling));

        // Upstream leg, cached and coalesced by fingerprint
        let compute = self.compute_future(&request.tool, &request.action, request.params.clone(), deadline);
        let (bytes, lookup) = if self.config.flags.cache {
            let ttl = self
                .config
                .tool_cache_ttls
                .get(&request.tool)
                .copied()
                .unwrap_or(self.config.cache_ttl);
            let outcome = self.cache.get_or_compute(&fp, ttl, compute).await?;
            #[allow(clippy::cast_possible_wrap)]
            self.metrics.set_cache_entries(self.cache.len() as i64);
            outcome
        } else {
            (compute.await?, Lookup::Computed)
        };
        if lookup.is_hit() {
            self.metrics.record_cache_hit(&request.tool, &request.action);
        }

        // Response shaping
        match shaping {
            Some(shaping) => Ok(apply_shaping(&bytes, &shaping)),
            None => Ok(bytes),
        }
    }

    /// Build the `'static` upstream computation the cache can share between
    /// coalesced subscribers: semaphore → breaker admit → retry loop →
    /// scoped credential acquisition → adapter call.
    fn compute_future(
        &self,
        tool: &str,
        action: &str,
        params: Value,
        deadline: Instant,
    ) -> impl std::future::Future<Output = Result<Bytes>> + Send + 'static {
        let tool = tool.to_string();
        let action = action.to_string();
        let breakers = Arc::clone(&self.breakers);
        let secrets = Arc::clone(&self.secrets);
        let adapters = Arc::clone(&self.adapters);
        let metrics = Arc::clone(&self.metrics);
        let semaphore = self.tool_semaphore(&tool);
        let flags = self.config.flags;
        let attempt_timeout = self.config.attempt_timeout;
        let retry_policy = if self.config.flags.retry {
            self.config.retry.clone()
        } else {
            RetryPolicy {
                enabled: false,
                ..self.config.retry.clone()
            }
        };

        async move {
            // Adapter concurrency bound: reject before the breaker so an
            // overloaded gateway does not skew failure accounting.
            let _permit = semaphore
                .try_acquire_owned()
                .map_err(|_| Error::Overloaded(format!("tool {tool} at concurrency limit")))?;

            let adapter = adapters.get(&tool, &action)?;
            let breaker = breakers.route(&tool, &action);
            if flags.breakers {
                breaker.admit()?;
            }

            let route = format!("{tool}:{action}");
            let result = with_retry(
                &retry_policy,
                deadline,
                &route,
                |e| metrics.record_retry(&tool, &action, e.reason_label()),
                || {
                    let adapter = Arc::clone(&adapter);
                    let secrets = Arc::clone(&secrets);
                    let tool = tool.clone();
                    let action = action.clone();
                    let params = params.clone();
                    async move {
                        let attempt_deadline = deadline.min(Instant::now() + attempt_timeout);
                        // Scoped acquisition: the plaintext is wiped when
                        // `credential` drops, on every exit path.
                        let credential = secrets.get_active(&tool)?;
                        adapter
                            .invoke(&action, &params, credential.expose(), attempt_deadline)
                            .await
                    }
                },
            )
            .await;

            // One breaker outcome per request: the retry loop's final
            // result, not each attempt. The window counts requests, so the
            // trip threshold is independent of the retry budget.
            match &result {
                Ok(_) => breaker.record_success(),
                Err(e) if e.counts_as_breaker_failure() => breaker.record_failure(),
                Err(_) => {}
            }
            result
        }
    }

    fn tool_semaphore(&self, tool: &str) -> Arc<Semaphore> {
        self.semaphores
            .entry(tool.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_concurrency)))
            .clone()
    }
}

/// Apply a shaping rule: redact named top-level fields of a JSON body.
/// Non-JSON bodies pass through untouched.
fn apply_shaping(bytes: &Bytes, shaping: &ResponseShaping) -> Bytes {
    let Ok(mut value) = serde_json::from_slice::<Value>(bytes) else {
        return bytes.clone();
    };
    if let Some(object) = value.as_object_mut() {
        for field in &shaping.redact_fields {
            if let Some(slot) = object.get_mut(field) {
                *slot = Value::String("[redacted]".into());
            }
        }
    }
    serde_json::to_vec(&value).map_or_else(|_| bytes.clone(), Bytes::from)
}

/// Opaque wire bodies for data-path failures. Administrative surfaces carry
/// full reason codes; this path never leaks policy or secret detail.
fn error_body(status: u16, error: &Error) -> Bytes {
    let body = match status {
        400 => json!({"error": "invalid_request"}),
        401 => json!({"error": "unauthorized"}),
        403 => match error {
            Error::PolicyDeny { reason } => json!({"error": "forbidden", "reason": reason}),
            _ => json!({"error": "forbidden"}),
        },
        429 => json!({"error": "rate_limited"}),
        503 => json!({"error": "upstream_unavailable"}),
        504 => json!({"error": "upstream_timeout"}),
        502 => json!({"error": "upstream_failure"}),
        _ => json!({"error": "internal"}),
    };
    Bytes::from(serde_json::to_vec(&body).unwrap_or_default())
}
