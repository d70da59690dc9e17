//! Token service: mint, validate, revoke.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngExt;
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::registry::{TokenRecord, TokenRegistry};
use super::wire::{self, TokenPayload};
use super::Scope;
use crate::agent::{AgentDirectory, AgentStatus};
use crate::error::AuthFailure;
use crate::metrics::GatewayMetrics;
use crate::telemetry::{TelemetryEvent, TelemetryLog};
use crate::{Error, Result};

/// Agent id label used on metrics when the token never identified one.
const UNKNOWN_AGENT_LABEL: &str = "unknown";

/// Result of a successful mint.
#[derive(Debug, Clone)]
pub struct MintedToken {
    /// Opaque wire token handed to the agent
    pub token: String,
    /// Registry id, used for revocation
    pub token_id: Uuid,
    /// Expiry instant
    pub expires_at: DateTime<Utc>,
}

/// Result of a successful validation.
#[derive(Debug, Clone)]
pub struct ValidatedToken {
    /// Token id the request is attributed to
    pub token_id: Uuid,
    /// Authenticated agent
    pub agent_id: Uuid,
    /// Agent role (for the policy engine)
    pub agent_role: String,
    /// The scope the token authorizes
    pub scope: Scope,
}

/// Mints, validates, and revokes agent tokens.
pub struct TokenService {
    secret: Zeroizing<Vec<u8>>,
    registry: Arc<TokenRegistry>,
    agents: Arc<AgentDirectory>,
    metrics: Arc<GatewayMetrics>,
    telemetry: Arc<TelemetryLog>,
    kek_version: u32,
}

impl TokenService {
    /// Create the service around its collaborators.
    #[must_use]
    pub fn new(
        secret: Vec<u8>,
        registry: Arc<TokenRegistry>,
        agents: Arc<AgentDirectory>,
        metrics: Arc<GatewayMetrics>,
        telemetry: Arc<TelemetryLog>,
        kek_version: u32,
    ) -> Self {
        Self {
            secret: Zeroizing::new(secret),
            registry,
            agents,
            metrics,
            telemetry,
            kek_version,
        }
    }

    /// Mint a token for `agent_id` with the given scope and TTL.
    ///
    /// The scope must be a subset of the agent's allowed tool surface, and
    /// the agent must exist and be active.
    pub fn mint(
        &self,
        agent_id: Uuid,
        scope: Scope,
        ttl: Duration,
        correlation_id: &str,
    ) -> Result<MintedToken> {
        let agent = self
            .agents
            .get(agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent {agent_id}")))?;
        if agent.status != AgentStatus::Active {
            return Err(Error::Validation("agent is disabled".into()));
        }
        if !agent.allows_tools(&scope.tools) {
            return Err(Error::Validation(
                "requested scope exceeds the agent's allowed tools".into(),
            ));
        }

        let now = Utc::now();
        let ttl_secs = i64::try_from(ttl.as_secs())
            .map_err(|_| Error::Validation("ttl too large".into()))?;
        if ttl_secs == 0 {
            return Err(Error::Validation("ttl must be at least one second".into()));
        }
        let expires_at = now + chrono::Duration::seconds(ttl_secs);

        let nonce: [u8; 16] = rand::rng().random();
        let payload = TokenPayload {
            token_id: Uuid::new_v4(),
            agent_id,
            scope: scope.clone(),
            issued_at: now.timestamp(),
            expires_at: expires_at.timestamp(),
            nonce: hex::encode(nonce),
            kek_version: self.kek_version,
        };
        let token = wire::encode(&payload, &self.secret);

        self.registry.insert(TokenRecord {
            id: payload.token_id,
            agent_id,
            scope,
            issued_at: now,
            expires_at,
            revoked: false,
            kek_version: self.kek_version,
            issued_by: "api".into(),
        });

        self.metrics
            .record_token_generation(&agent_id.to_string());
        self.telemetry.record(
            TelemetryEvent::token_minted(correlation_id, ttl_secs)
                .with_agent(&agent_id.to_string())
                .with_token(&payload.token_id.to_string()),
        );
        debug!(agent_id = %agent_id, token_id = %payload.token_id, "Minted token");

        Ok(MintedToken {
            token,
            token_id: payload.token_id,
            expires_at,
        })
    }

    /// Validate a wire token.
    ///
    /// Failures are distinguished internally (metrics + telemetry) but reach
    /// the caller as [`Error::Auth`], which the wire surface collapses to an
    /// opaque 401.
    pub fn validate(&self, token: &str, correlation_id: &str) -> Result<ValidatedToken> {
        match self.validate_inner(token) {
            Ok(valid) => {
                self.metrics
                    .record_token_validation(&valid.agent_id.to_string(), true);
                Ok(valid)
            }
            Err((failure, agent_id)) => {
                let agent_label =
                    agent_id.map_or_else(|| UNKNOWN_AGENT_LABEL.to_string(), |id| id.to_string());
                self.metrics.record_token_validation(&agent_label, false);
                if failure == AuthFailure::Expired {
                    self.metrics.record_token_expiration(&agent_label);
                }
                let mut event = TelemetryEvent::token_rejected(correlation_id, failure.as_str());
                if let Some(id) = agent_id {
                    event = event.with_agent(&id.to_string());
                }
                self.telemetry.record(event);
                warn!(reason = failure.as_str(), "Token validation failed");
                Err(Error::Auth(failure))
            }
        }
    }

    /// The actual checks, with the agent id (when known) threaded out for
    /// metric labels. A single clock sample covers all temporal checks;
    /// `now == expires_at` is still valid (inclusive boundary).
    fn validate_inner(
        &self,
        token: &str,
    ) -> std::result::Result<ValidatedToken, (AuthFailure, Option<Uuid>)> {
        let payload = wire::decode(token, &self.secret).map_err(|f| (f, None))?;
        let agent_id = payload.agent_id;
        let now = Utc::now().timestamp();

        // A payload with a valid signature but no registry row means the
        // row was reaped or the token predates a restart; fail closed.
        let record = self
            .registry
            .get(payload.token_id)
            .ok_or((AuthFailure::Revoked, Some(agent_id)))?;
        if record.revoked {
            return Err((AuthFailure::Revoked, Some(agent_id)));
        }
        if now > payload.expires_at {
            return Err((AuthFailure::Expired, Some(agent_id)));
        }
        if now < payload.issued_at {
            return Err((AuthFailure::Malformed, Some(agent_id)));
        }

        let agent = self
            .agents
            .get(agent_id)
            .ok_or((AuthFailure::UnknownAgent, Some(agent_id)))?;
        if agent.status != AgentStatus::Active {
            return Err((AuthFailure::UnknownAgent, Some(agent_id)));
        }
        if !agent.allows_tools(&payload.scope.tools) {
            return Err((AuthFailure::ScopeOutOfBounds, Some(agent_id)));
        }

        Ok(ValidatedToken {
            token_id: payload.token_id,
            agent_id,
            agent_role: agent.role,
            scope: payload.scope,
        })
    }

    /// Revoke a token by id. Idempotent; unknown ids are not an error on
    /// re-delivery, but the first call reports them.
    pub fn revoke(&self, token_id: Uuid, correlation_id: &str) -> Result<()> {
        if self.registry.revoke(token_id) {
            self.telemetry.record(
                TelemetryEvent::token_revoked(correlation_id)
                    .with_token(&token_id.to_string()),
            );
            Ok(())
        } else {
            Err(Error::NotFound(format!("token {token_id}")))
        }
    }

    /// Revoke every token of an agent (cascade on disable).
    pub fn revoke_for_agent(&self, agent_id: Uuid) -> usize {
        self.registry.revoke_for_agent(agent_id)
    }

    /// Administrative listing.
    #[must_use]
    pub fn list(&self, agent_id: Option<Uuid>) -> Vec<TokenRecord> {
        self.registry.list(agent_id)
    }
}
