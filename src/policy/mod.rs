//! Policy engine: deterministic authorization of (agent, tool, action, params).
//!
//! Evaluation stages, all of which must pass:
//!
//! 1. **Scope** — the token must grant the tool and action.
//! 2. **Role rules** — declaration order, first matching rule wins.
//!    Unmatched requests fall through to default-deny for sensitive tools
//!    and default-allow for read-only tools the token already grants.
//! 3. **Parameter constraints** — per-tool predicates (URL allowlists,
//!    recipient domain lists).
//! 4. **Quotas** — sliding-window counters per (agent, tool, action).
//! 5. **Schedule** — optional time-of-day windows.
//!
//! The engine is deterministic and side-effect-free beyond counter
//! increments (quota counts, denial metrics).

pub mod quota;

pub use quota::{QuotaTracker, spawn_sweeper};

use std::sync::Arc;

use chrono::{Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::metrics::GatewayMetrics;
use crate::telemetry::{TelemetryEvent, TelemetryLog};
use crate::token::Scope;

/// Effect a rule assigns to matching requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEffect {
    /// Admit the request
    Allow,
    /// Reject the request
    Deny,
    /// Reject until an out-of-band approval exists
    RequireApproval,
}

/// One declarative policy rule. All populated match fields must match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Match a specific agent (takes precedence over role in practice by
    /// ordering the rule earlier)
    #[serde(default)]
    pub agent_id: Option<Uuid>,
    /// Match an agent role
    #[serde(default)]
    pub role: Option<String>,
    /// Match a tool (`None` = any)
    #[serde(default)]
    pub tool: Option<String>,
    /// Match an action (`None` = any)
    #[serde(default)]
    pub action: Option<String>,
    /// Effect when the rule fires
    pub effect: PolicyEffect,
    /// Response fields to redact when this rule allows the request
    #[serde(default)]
    pub redact_fields: Vec<String>,
}

impl PolicyRule {
    fn matches(&self, agent_id: Uuid, role: &str, tool: &str, action: &str) -> bool {
        if let Some(id) = self.agent_id {
            if id != agent_id {
                return false;
            }
        }
        if let Some(ref r) = self.role {
            if r != role {
                return false;
            }
        }
        if let Some(ref t) = self.tool {
            if t != tool {
                return false;
            }
        }
        if let Some(ref a) = self.action {
            if a != action {
                return false;
            }
        }
        true
    }
}

/// Parameter constraints for the HTTP fetch tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConstraints {
    /// Domains (exact or suffix) the `url` parameter may point at
    pub allowed_domains: Vec<String>,
    /// Response size ceiling enforced by the adapter
    pub max_response_bytes: u64,
}

impl Default for FetchConstraints {
    fn default() -> Self {
        Self {
            allowed_domains: Vec::new(),
            max_response_bytes: 1_048_576,
        }
    }
}

/// Parameter constraints for the mail tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConstraints {
    /// Domains the `to` parameter may deliver to
    pub allowed_recipient_domains: Vec<String>,
}

/// A quota rule: limit per window for matching (role, tool, action).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaRule {
    /// Match an agent role (`None` = any)
    #[serde(default)]
    pub role: Option<String>,
    /// Match a tool (`None` = any)
    #[serde(default)]
    pub tool: Option<String>,
    /// Match an action (`None` = any)
    #[serde(default)]
    pub action: Option<String>,
    /// Admissions per window
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
}

/// A schedule rule: requests matching it are admitted only inside the
/// `[start_hour, end_hour)` UTC window (wrapping overnight when
/// `start_hour > end_hour`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRule {
    /// Match an agent role (`None` = any)
    #[serde(default)]
    pub role: Option<String>,
    /// Match a tool (`None` = any)
    #[serde(default)]
    pub tool: Option<String>,
    /// First admitted hour (UTC)
    pub start_hour: u8,
    /// First rejected hour (UTC)
    pub end_hour: u8,
}

impl ScheduleRule {
    fn admits_hour(&self, hour: u8) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Full policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Ordered rule list; first match wins
    pub rules: Vec<PolicyRule>,
    /// Tools that default-deny without an explicit allow rule
    pub sensitive_tools: Vec<String>,
    /// Tools that default-allow when the token grants them
    pub read_only_tools: Vec<String>,
    /// HTTP fetch parameter constraints
    pub fetch: FetchConstraints,
    /// Mail parameter constraints
    pub mail: MailConstraints,
    /// Quota rules (first applicable rule is enforced)
    pub quotas: Vec<QuotaRule>,
    /// Schedule rules (every applicable rule must admit)
    pub schedules: Vec<ScheduleRule>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            sensitive_tools: vec!["gmail_send".into(), "code_exec".into()],
            read_only_tools: vec!["serpapi".into(), "http_fetch".into(), "openai".into()],
            fetch: FetchConstraints::default(),
            mail: MailConstraints::default(),
            quotas: Vec::new(),
            schedules: Vec::new(),
        }
    }
}

/// Response-shaping annotation attached to an allow decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseShaping {
    /// Top-level response fields to redact before returning
    pub redact_fields: Vec<String>,
}

/// Outcome of policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Admit, optionally shaping the response
    Allow {
        /// Shaping rule from the matched policy rule, if any
        shaping: Option<ResponseShaping>,
    },
    /// Reject with a non-leaking reason code
    Deny {
        /// `scope`, `role`, `params`, `quota`, or `schedule`
        reason: String,
    },
    /// Reject pending approval
    RequireApproval {
        /// Reason code for the approval requirement
        reason: String,
    },
}

/// The request under evaluation.
#[derive(Debug)]
pub struct PolicyRequest<'a> {
    /// Authenticated agent
    pub agent_id: Uuid,
    /// Agent role
    pub role: &'a str,
    /// Token scope
    pub scope: &'a Scope,
    /// Requested tool
    pub tool: &'a str,
    /// Requested action
    pub action: &'a str,
    /// Opaque request parameters
    pub params: &'a Value,
}

/// The policy engine.
pub struct PolicyEngine {
    config: PolicyConfig,
    quotas: Arc<QuotaTracker>,
    metrics: Arc<GatewayMetrics>,
    telemetry: Arc<TelemetryLog>,
}

impl PolicyEngine {
    /// Build the engine from configuration.
    #[must_use]
    pub fn new(
        config: PolicyConfig,
        quotas: Arc<QuotaTracker>,
        metrics: Arc<GatewayMetrics>,
        telemetry: Arc<TelemetryLog>,
    ) -> Self {
        Self {
            config,
            quotas,
            metrics,
            telemetry,
        }
    }

    /// Evaluate a request. Non-allow outcomes emit
    /// `policy_denials_total{agent_id,tool,action,reason}` and a telemetry
    /// event under the request's correlation id.
    pub fn evaluate(&self, req: &PolicyRequest<'_>, correlation_id: &str) -> Decision {
        let decision = self.evaluate_at(req, Utc::now().timestamp());
        match &decision {
            Decision::Allow { .. } => {}
            Decision::Deny { reason } | Decision::RequireApproval { reason } => {
                self.metrics.record_policy_denial(
                    &req.agent_id.to_string(),
                    req.tool,
                    req.action,
                    reason,
                );
                self.telemetry.record(
                    TelemetryEvent::policy_denied(correlation_id, req.tool, req.action, reason)
                        .with_agent(&req.agent_id.to_string()),
                );
                debug!(tool = req.tool, action = req.action, reason, "Policy denied request");
            }
        }
        decision
    }

    /// Deterministic evaluation at an explicit instant (quota and schedule
    /// stages consume `now`).
    fn evaluate_at(&self, req: &PolicyRequest<'_>, now: i64) -> Decision {
        // Stage 1: scope
        if !req.scope.allows_tool(req.tool) || !req.scope.allows_action(req.action) {
            return Decision::Deny {
                reason: "scope".into(),
            };
        }

        // Stage 2: role rules, first match wins
        let shaping = match self.role_stage(req) {
            Ok(shaping) => shaping,
            Err(decision) => return decision,
        };

        // Stage 3: parameter constraints
        if let Err(reason) = self.check_params(req.tool, req.params) {
            return Decision::Deny { reason };
        }

        // Stage 4: quotas
        if let Some(rule) = self.config.quotas.iter().find(|q| {
            q.role.as_deref().is_none_or(|r| r == req.role)
                && q.tool.as_deref().is_none_or(|t| t == req.tool)
                && q.action.as_deref().is_none_or(|a| a == req.action)
        }) {
            let key = format!("{}:{}:{}", req.agent_id, req.tool, req.action);
            if !self
                .quotas
                .check_and_increment(&key, rule.limit, rule.window_secs, now)
            {
                return Decision::Deny {
                    reason: "quota".into(),
                };
            }
        }

        // Stage 5: schedule
        #[allow(clippy::cast_possible_truncation)]
        let hour = chrono::DateTime::from_timestamp(now, 0)
            .unwrap_or_default()
            .hour() as u8;
        for rule in &self.config.schedules {
            let applies = rule.role.as_deref().is_none_or(|r| r == req.role)
                && rule.tool.as_deref().is_none_or(|t| t == req.tool);
            if applies && !rule.admits_hour(hour) {
                return Decision::Deny {
                    reason: "schedule".into(),
                };
            }
        }

        Decision::Allow { shaping }
    }

    fn role_stage(&self, req: &PolicyRequest<'_>) -> Result<Option<ResponseShaping>, Decision> {
        for rule in &self.config.rules {
            if rule.matches(req.agent_id, req.role, req.tool, req.action) {
                return match rule.effect {
                    PolicyEffect::Allow => Ok((!rule.redact_fields.is_empty()).then(|| {
                        ResponseShaping {
                            redact_fields: rule.redact_fields.clone(),
                        }
                    })),
                    PolicyEffect::Deny => Err(Decision::Deny {
                        reason: "role".into(),
                    }),
                    PolicyEffect::RequireApproval => Err(Decision::RequireApproval {
                        reason: "approval".into(),
                    }),
                };
            }
        }
        // No rule matched: sensitive tools fail closed, read-only tools the
        // token already grants pass through, anything else fails closed.
        if self.config.sensitive_tools.iter().any(|t| t == req.tool) {
            return Err(Decision::Deny {
                reason: "role".into(),
            });
        }
        if self.config.read_only_tools.iter().any(|t| t == req.tool) {
            return Ok(None);
        }
        Err(Decision::Deny {
            reason: "role".into(),
        })
    }

    fn check_params(&self, tool: &str, params: &Value) -> Result<(), String> {
        match tool {
            "http_fetch" => {
                let raw = params
                    .get("url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "params".to_string())?;
                let url = Url::parse(raw).map_err(|_| "params".to_string())?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err("params".into());
                }
                let host = url.host_str().ok_or_else(|| "params".to_string())?;
                if !domain_allowed(host, &self.config.fetch.allowed_domains) {
                    return Err("params".into());
                }
                Ok(())
            }
            "gmail_send" => {
                let to = params
                    .get("to")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "params".to_string())?;
                let domain = to.rsplit_once('@').map(|(_, d)| d).unwrap_or("");
                if domain.is_empty()
                    || !domain_allowed(domain, &self.config.mail.allowed_recipient_domains)
                {
                    return Err("params".into());
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// The fetch constraints, read by the HTTP adapter for its size cap.
    #[must_use]
    pub fn fetch_constraints(&self) -> &FetchConstraints {
        &self.config.fetch
    }
}

/// Exact or subdomain suffix match against an allowlist. An empty allowlist
/// admits nothing.
fn domain_allowed(host: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|entry| {
        host == entry || host.ends_with(&format!(".{entry}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine(config: PolicyConfig) -> PolicyEngine {
        PolicyEngine::new(
            config,
            Arc::new(QuotaTracker::new()),
            Arc::new(GatewayMetrics::new()),
            Arc::new(TelemetryLog::new()),
        )
    }

    fn scope(tools: &[&str], actions: &[&str]) -> Scope {
        Scope::new(
            tools.iter().map(ToString::to_string).collect(),
            actions.iter().map(ToString::to_string).collect(),
            vec!["read".into()],
        )
    }

    fn request<'a>(
        agent_id: Uuid,
        scope: &'a Scope,
        tool: &'a str,
        action: &'a str,
        params: &'a Value,
    ) -> PolicyRequest<'a> {
        PolicyRequest {
            agent_id,
            role: "researcher",
            scope,
            tool,
            action,
            params,
        }
    }

    #[test]
    fn scope_mismatch_denies_first() {
        let engine = engine(PolicyConfig::default());
        let scope = scope(&["serpapi"], &["search"]);
        let params = json!({});
        let req = request(Uuid::new_v4(), &scope, "gmail_send", "send", &params);

        assert_eq!(
            engine.evaluate_at(&req, 0),
            Decision::Deny { reason: "scope".into() }
        );
    }

    #[test]
    fn read_only_tool_in_scope_default_allows() {
        let engine = engine(PolicyConfig::default());
        let scope = scope(&["serpapi"], &["search"]);
        let params = json!({"q": "x"});
        let req = request(Uuid::new_v4(), &scope, "serpapi", "search", &params);

        assert!(matches!(engine.evaluate_at(&req, 0), Decision::Allow { .. }));
    }

    #[test]
    fn sensitive_tool_without_rule_denies_on_role() {
        let mut config = PolicyConfig::default();
        config.mail.allowed_recipient_domains = vec!["example.com".into()];
        let engine = engine(config);
        // Token grants the tool, but no role rule allows it
        let scope = scope(&["gmail_send"], &["send"]);
        let params = json!({"to": "a@example.com"});
        let req = request(Uuid::new_v4(), &scope, "gmail_send", "send", &params);

        assert_eq!(
            engine.evaluate_at(&req, 0),
            Decision::Deny { reason: "role".into() }
        );
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut config = PolicyConfig::default();
        config.rules = vec![
            PolicyRule {
                agent_id: None,
                role: Some("researcher".into()),
                tool: Some("gmail_send".into()),
                action: None,
                effect: PolicyEffect::Allow,
                redact_fields: vec![],
            },
            PolicyRule {
                agent_id: None,
                role: None,
                tool: Some("gmail_send".into()),
                action: None,
                effect: PolicyEffect::Deny,
                redact_fields: vec![],
            },
        ];
        config.mail.allowed_recipient_domains = vec!["example.com".into()];
        let engine = engine(config);
        let scope = scope(&["gmail_send"], &["send"]);
        let params = json!({"to": "ops@example.com"});
        let req = request(Uuid::new_v4(), &scope, "gmail_send", "send", &params);

        assert!(matches!(engine.evaluate_at(&req, 0), Decision::Allow { .. }));
    }

    #[test]
    fn require_approval_rule_surfaces_as_such() {
        let mut config = PolicyConfig::default();
        config.rules = vec![PolicyRule {
            agent_id: None,
            role: None,
            tool: Some("serpapi".into()),
            action: None,
            effect: PolicyEffect::RequireApproval,
            redact_fields: vec![],
        }];
        let engine = engine(config);
        let scope = scope(&["serpapi"], &["search"]);
        let params = json!({});
        let req = request(Uuid::new_v4(), &scope, "serpapi", "search", &params);

        assert!(matches!(
            engine.evaluate_at(&req, 0),
            Decision::RequireApproval { .. }
        ));
    }

    #[test]
    fn fetch_url_must_be_allowlisted() {
        let mut config = PolicyConfig::default();
        config.fetch.allowed_domains = vec!["example.com".into()];
        let engine = engine(config);
        let scope = scope(&["http_fetch"], &["get"]);

        let ok = json!({"url": "https://api.example.com/v1"});
        let req = request(Uuid::new_v4(), &scope, "http_fetch", "get", &ok);
        assert!(matches!(engine.evaluate_at(&req, 0), Decision::Allow { .. }));

        let bad = json!({"url": "https://evil.test/"});
        let req = request(Uuid::new_v4(), &scope, "http_fetch", "get", &bad);
        assert_eq!(
            engine.evaluate_at(&req, 0),
            Decision::Deny { reason: "params".into() }
        );

        // Suffix trickery does not pass
        let tricky = json!({"url": "https://notexample.com/"});
        let req = request(Uuid::new_v4(), &scope, "http_fetch", "get", &tricky);
        assert_eq!(
            engine.evaluate_at(&req, 0),
            Decision::Deny { reason: "params".into() }
        );

        // Non-http schemes are rejected outright
        let scheme = json!({"url": "file:///etc/passwd"});
        let req = request(Uuid::new_v4(), &scope, "http_fetch", "get", &scheme);
        assert_eq!(
            engine.evaluate_at(&req, 0),
            Decision::Deny { reason: "params".into() }
        );
    }

    #[test]
    fn mail_recipient_domain_is_constrained() {
        let mut config = PolicyConfig::default();
        config.rules = vec![PolicyRule {
            agent_id: None,
            role: None,
            tool: Some("gmail_send".into()),
            action: None,
            effect: PolicyEffect::Allow,
            redact_fields: vec![],
        }];
        config.mail.allowed_recipient_domains = vec!["example.com".into()];
        let engine = engine(config);
        let scope = scope(&["gmail_send"], &["send"]);

        let ok = json!({"to": "ops@example.com"});
        let req = request(Uuid::new_v4(), &scope, "gmail_send", "send", &ok);
        assert!(matches!(engine.evaluate_at(&req, 0), Decision::Allow { .. }));

        let bad = json!({"to": "ops@elsewhere.net"});
        let req = request(Uuid::new_v4(), &scope, "gmail_send", "send", &bad);
        assert_eq!(
            engine.evaluate_at(&req, 0),
            Decision::Deny { reason: "params".into() }
        );
    }

    #[test]
    fn quota_denies_after_limit() {
        let mut config = PolicyConfig::default();
        config.quotas = vec![QuotaRule {
            role: None,
            tool: Some("serpapi".into()),
            action: None,
            limit: 2,
            window_secs: 60,
        }];
        let engine = engine(config);
        let scope = scope(&["serpapi"], &["search"]);
        let params = json!({});
        let agent = Uuid::new_v4();
        let req = request(agent, &scope, "serpapi", "search", &params);

        assert!(matches!(engine.evaluate_at(&req, 60), Decision::Allow { .. }));
        assert!(matches!(engine.evaluate_at(&req, 60), Decision::Allow { .. }));
        assert_eq!(
            engine.evaluate_at(&req, 60),
            Decision::Deny { reason: "quota".into() }
        );
    }

    #[test]
    fn schedule_window_denies_outside_hours() {
        let mut config = PolicyConfig::default();
        config.schedules = vec![ScheduleRule {
            role: None,
            tool: Some("serpapi".into()),
            start_hour: 8,
            end_hour: 18,
        }];
        let engine = engine(config);
        let scope = scope(&["serpapi"], &["search"]);
        let params = json!({});
        let req = request(Uuid::new_v4(), &scope, "serpapi", "search", &params);

        // 12:00 UTC admits, 03:00 UTC does not
        let noon = 12 * 3600;
        let night = 3 * 3600;
        assert!(matches!(engine.evaluate_at(&req, noon), Decision::Allow { .. }));
        assert_eq!(
            engine.evaluate_at(&req, night),
            Decision::Deny { reason: "schedule".into() }
        );
    }

    #[test]
    fn overnight_schedule_wraps() {
        let rule = ScheduleRule {
            role: None,
            tool: None,
            start_hour: 22,
            end_hour: 6,
        };
        assert!(rule.admits_hour(23));
        assert!(rule.admits_hour(2));
        assert!(!rule.admits_hour(12));
    }

    #[test]
    fn allow_rule_carries_shaping_annotation() {
        let mut config = PolicyConfig::default();
        config.rules = vec![PolicyRule {
            agent_id: None,
            role: None,
            tool: Some("serpapi".into()),
            action: None,
            effect: PolicyEffect::Allow,
            redact_fields: vec!["raw_html".into()],
        }];
        let engine = engine(config);
        let scope = scope(&["serpapi"], &["search"]);
        let params = json!({});
        let req = request(Uuid::new_v4(), &scope, "serpapi", "search", &params);

        match engine.evaluate_at(&req, 0) {
            Decision::Allow { shaping: Some(shaping) } => {
                assert_eq!(shaping.redact_fields, vec!["raw_html".to_string()]);
            }
            other => panic!("expected shaped allow, got {other:?}"),
        }
    }

    #[test]
    fn denial_emits_metric_with_reason() {
        let metrics = Arc::new(GatewayMetrics::new());
        let engine = PolicyEngine::new(
            PolicyConfig::default(),
            Arc::new(QuotaTracker::new()),
            Arc::clone(&metrics),
            Arc::new(TelemetryLog::new()),
        );
        let scope = scope(&["serpapi"], &["search"]);
        let params = json!({});
        let agent = Uuid::new_v4();
        let req = request(agent, &scope, "gmail_send", "send", &params);

        engine.evaluate(&req, "corr");
        assert_eq!(
            metrics.policy_denials_total(&agent.to_string(), "gmail_send", "send", "scope"),
            1
        );
    }
}
