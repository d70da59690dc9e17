//! Error types for the gateway

use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Token validation failure kinds.
///
/// Distinguished in telemetry and metrics, but collapsed to a single opaque
/// 401 on the wire so the validator is not a token oracle.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// Token past its expiry instant
    #[error("token expired")]
    Expired,
    /// Token explicitly revoked
    #[error("token revoked")]
    Revoked,
    /// HMAC tag does not match the payload
    #[error("bad signature")]
    BadSignature,
    /// Token references an agent that does not exist or is disabled
    #[error("unknown agent")]
    UnknownAgent,
    /// Requested scope exceeds the agent's allowed surface
    #[error("scope out of bounds")]
    ScopeOutOfBounds,
    /// Wire form is not `base64url(payload).base64url(tag)`
    #[error("malformed token")]
    Malformed,
}

impl AuthFailure {
    /// Label used on `token_validations_total` and telemetry events.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::BadSignature => "bad_signature",
            Self::UnknownAgent => "unknown_agent",
            Self::ScopeOutOfBounds => "scope_out_of_bounds",
            Self::Malformed => "malformed",
        }
    }
}

/// Gateway errors.
///
/// All variants carry owned payloads so the error is `Clone`: single-flight
/// subscribers receive the same failure as the requester that computed it.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Configuration error (startup; maps to exit code 2)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed input on an API surface
    #[error("Validation error: {0}")]
    Validation(String),

    /// Token invalid, expired, or revoked
    #[error("Authentication failed")]
    Auth(AuthFailure),

    /// Policy engine denied the request
    #[error("Policy denied: {reason}")]
    PolicyDeny {
        /// Non-leaking reason code (`scope`, `role`, `params`, `schedule`)
        reason: String,
    },

    /// Sliding-window quota exhausted
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Unknown agent, token, credential (admin surfaces only)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Circuit breaker fast-fail for a route
    #[error("Circuit open for {tool}:{action}")]
    BreakerOpen {
        /// Tool id of the route
        tool: String,
        /// Action id of the route
        action: String,
    },

    /// Upstream did not answer within the per-attempt or total deadline
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Retryable upstream failure (5xx, transient network error)
    #[error("Upstream failure: {0}")]
    Upstream(String),

    /// Terminal upstream failure (4xx from the provider, malformed reply)
    #[error("Upstream rejected request: {0}")]
    UpstreamTerminal(String),

    /// Concurrency or coalescing cap exceeded
    #[error("Overloaded: {0}")]
    Overloaded(String),

    /// Envelope decryption failed (tag mismatch or corrupt record)
    #[error("Decryption error")]
    Decryption,

    /// Anything uncaught
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status code this error surfaces as on the data path.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Auth(_) => 401,
            Self::PolicyDeny { .. } => 403,
            Self::NotFound(_) => 404,
            Self::QuotaExceeded(_) | Self::Overloaded(_) => 429,
            Self::Upstream(_) | Self::UpstreamTerminal(_) => 502,
            Self::BreakerOpen { .. } => 503,
            Self::UpstreamTimeout(_) => 504,
            Self::Config(_) | Self::Decryption | Self::Internal(_) => 500,
        }
    }

    /// Whether the retry loop may re-attempt after this error.
    ///
    /// Policy denials, validation errors, and breaker fast-fails are never
    /// retried; only timeouts, 5xx, and transient transport failures are.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::UpstreamTimeout(_))
    }

    /// Whether this outcome counts as a failure for the circuit breaker.
    ///
    /// Client-side errors (4xx, policy, auth) leave breaker counters
    /// unchanged; only genuine upstream trouble trips the circuit.
    #[must_use]
    pub fn counts_as_breaker_failure(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::UpstreamTimeout(_))
    }

    /// Reason label used on `retries_total` and telemetry events.
    #[must_use]
    pub fn reason_label(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Validation(_) => "validation",
            Self::Auth(_) => "auth",
            Self::PolicyDeny { .. } => "policy",
            Self::QuotaExceeded(_) => "quota",
            Self::NotFound(_) => "not_found",
            Self::BreakerOpen { .. } => "breaker_open",
            Self::UpstreamTimeout(_) => "timeout",
            Self::Upstream(_) => "upstream_5xx",
            Self::UpstreamTerminal(_) => "upstream_4xx",
            Self::Overloaded(_) => "overloaded",
            Self::Decryption => "decryption",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification_matches_taxonomy() {
        assert!(Error::Upstream("503".into()).is_retryable());
        assert!(Error::UpstreamTimeout("t".into()).is_retryable());
        assert!(!Error::UpstreamTerminal("400".into()).is_retryable());
        assert!(!Error::PolicyDeny { reason: "scope".into() }.is_retryable());
        assert!(!Error::BreakerOpen { tool: "t".into(), action: "a".into() }.is_retryable());
        assert!(!Error::Auth(AuthFailure::Expired).is_retryable());
    }

    #[test]
    fn breaker_failures_exclude_client_errors() {
        assert!(Error::Upstream("500".into()).counts_as_breaker_failure());
        assert!(Error::UpstreamTimeout("t".into()).counts_as_breaker_failure());
        assert!(!Error::UpstreamTerminal("404".into()).counts_as_breaker_failure());
        assert!(!Error::QuotaExceeded("q".into()).counts_as_breaker_failure());
    }

    #[test]
    fn http_status_mapping_covers_terminal_states() {
        assert_eq!(Error::Auth(AuthFailure::BadSignature).http_status(), 401);
        assert_eq!(Error::PolicyDeny { reason: "scope".into() }.http_status(), 403);
        assert_eq!(Error::QuotaExceeded("q".into()).http_status(), 429);
        assert_eq!(Error::Overloaded("o".into()).http_status(), 429);
        assert_eq!(Error::Upstream("u".into()).http_status(), 502);
        assert_eq!(
            Error::BreakerOpen { tool: "t".into(), action: "a".into() }.http_status(),
            503
        );
        assert_eq!(Error::UpstreamTimeout("t".into()).http_status(), 504);
    }
}
