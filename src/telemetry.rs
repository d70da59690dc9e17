//! Append-only telemetry log for security-relevant gateway events.
//!
//! Every denial, breaker transition, token lifecycle event, and credential
//! rotation lands here with a correlation id. Events are held in a bounded
//! in-memory ring (drop-oldest with a counter under pressure) and mirrored as
//! structured `tracing` records so any log aggregator sees the same trail.
//! The log is off the hot path: recording is a short ring push, never I/O.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Default ring capacity.
pub const DEFAULT_CAPACITY: usize = 4096;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Policy engine returned deny or require-approval
    PolicyDenied,
    /// Circuit breaker changed state
    BreakerTransition,
    /// A token was minted
    TokenMinted,
    /// A token failed validation
    TokenRejected,
    /// A token was revoked
    TokenRevoked,
    /// A credential version was stored
    CredentialStored,
    /// A credential version became the active one
    CredentialActivated,
    /// Every credential was rewrapped under a new KEK
    KekRewrapped,
    /// An agent was created
    AgentCreated,
    /// An agent was disabled (tokens cascade-revoked)
    AgentDisabled,
}

/// How bad it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Expected lifecycle event
    Info,
    /// Rejected request or degraded route
    Warn,
}

/// One audit record.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    /// Unique event id
    pub id: Uuid,
    /// When the event was recorded
    pub timestamp: DateTime<Utc>,
    /// Correlation id of the request or administrative flow
    pub correlation_id: String,
    /// Agent involved, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Token involved, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    /// Event kind
    pub kind: EventKind,
    /// Severity
    pub severity: Severity,
    /// Kind-specific detail; never contains secret material
    pub payload: Value,
}

impl TelemetryEvent {
    fn new(correlation_id: &str, kind: EventKind, severity: Severity, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: correlation_id.to_string(),
            agent_id: None,
            token_id: None,
            kind,
            severity,
            payload,
        }
    }

    /// Attach an agent id.
    #[must_use]
    pub fn with_agent(mut self, agent_id: &str) -> Self {
        self.agent_id = Some(agent_id.to_string());
        self
    }

    /// Attach a token id.
    #[must_use]
    pub fn with_token(mut self, token_id: &str) -> Self {
        self.token_id = Some(token_id.to_string());
        self
    }

    /// A non-allow policy decision.
    #[must_use]
    pub fn policy_denied(correlation_id: &str, tool: &str, action: &str, reason: &str) -> Self {
        Self::new(
            correlation_id,
            EventKind::PolicyDenied,
            Severity::Warn,
            serde_json::json!({ "tool": tool, "action": action, "reason": reason }),
        )
    }

    /// A breaker state transition.
    #[must_use]
    pub fn breaker_transition(tool: &str, action: &str, from: &str, to: &str) -> Self {
        Self::new(
            "breaker",
            EventKind::BreakerTransition,
            Severity::Warn,
            serde_json::json!({ "tool": tool, "action": action, "from": from, "to": to }),
        )
    }

    /// A successful token mint.
    #[must_use]
    pub fn token_minted(correlation_id: &str, ttl_secs: i64) -> Self {
        Self::new(
            correlation_id,
            EventKind::TokenMinted,
            Severity::Info,
            serde_json::json!({ "ttl_secs": ttl_secs }),
        )
    }

    /// A failed token validation, with the internal failure kind.
    #[must_use]
    pub fn token_rejected(correlation_id: &str, reason: &str) -> Self {
        Self::new(
            correlation_id,
            EventKind::TokenRejected,
            Severity::Warn,
            serde_json::json!({ "reason": reason }),
        )
    }

    /// A token revocation.
    #[must_use]
    pub fn token_revoked(correlation_id: &str) -> Self {
        Self::new(
            correlation_id,
            EventKind::TokenRevoked,
            Severity::Info,
            Value::Null,
        )
    }

    /// A stored credential version.
    #[must_use]
    pub fn credential_stored(correlation_id: &str, tool: &str, version: u64) -> Self {
        Self::new(
            correlation_id,
            EventKind::CredentialStored,
            Severity::Info,
            serde_json::json!({ "tool": tool, "version": version }),
        )
    }

    /// A credential activation.
    #[must_use]
    pub fn credential_activated(correlation_id: &str, tool: &str, version: u64) -> Self {
        Self::new(
            correlation_id,
            EventKind::CredentialActivated,
            Severity::Info,
            serde_json::json!({ "tool": tool, "version": version }),
        )
    }

    /// A KEK rotation rewrap.
    #[must_use]
    pub fn kek_rewrapped(correlation_id: &str, records: usize, new_version: u32) -> Self {
        Self::new(
            correlation_id,
            EventKind::KekRewrapped,
            Severity::Info,
            serde_json::json!({ "records": records, "kek_version": new_version }),
        )
    }

    /// An agent creation.
    #[must_use]
    pub fn agent_created(correlation_id: &str, role: &str) -> Self {
        Self::new(
            correlation_id,
            EventKind::AgentCreated,
            Severity::Info,
            serde_json::json!({ "role": role }),
        )
    }

    /// An agent disable, with the number of cascade-revoked tokens.
    #[must_use]
    pub fn agent_disabled(correlation_id: &str, revoked_tokens: usize) -> Self {
        Self::new(
            correlation_id,
            EventKind::AgentDisabled,
            Severity::Info,
            serde_json::json!({ "revoked_tokens": revoked_tokens }),
        )
    }
}

/// Bounded append-only event sink.
pub struct TelemetryLog {
    ring: Mutex<VecDeque<TelemetryEvent>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl TelemetryLog {
    /// Create a log with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a log holding at most `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append an event, evicting the oldest when full.
    pub fn record(&self, event: TelemetryEvent) {
        tracing::info!(
            kind = ?event.kind,
            correlation_id = %event.correlation_id,
            agent_id = event.agent_id.as_deref().unwrap_or(""),
            audit = %serde_json::to_string(&event).unwrap_or_default(),
            "telemetry event"
        );

        let mut ring = self.ring.lock();
        if ring.len() >= self.capacity {
            ring.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        ring.push_back(event);
    }

    /// Events sharing a correlation id, oldest first.
    #[must_use]
    pub fn by_correlation(&self, correlation_id: &str) -> Vec<TelemetryEvent> {
        self.ring
            .lock()
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .cloned()
            .collect()
    }

    /// Events involving an agent, oldest first.
    #[must_use]
    pub fn by_agent(&self, agent_id: &str) -> Vec<TelemetryEvent> {
        self.ring
            .lock()
            .iter()
            .filter(|e| e.agent_id.as_deref() == Some(agent_id))
            .cloned()
            .collect()
    }

    /// The most recent `limit` events, oldest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<TelemetryEvent> {
        let ring = self.ring.lock();
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }

    /// Number of events evicted because the ring was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current event count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    /// Whether the log holds no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }
}

impl Default for TelemetryLog {
    fn default() -> Self {
        Self::new()
    }
}
