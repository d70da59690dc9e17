//! Token lifecycle: mint, validate, revoke, and the registry behind them.
//!
//! Tokens are short-lived, scope-bound bearer artifacts. The opaque wire
//! form is `base64url(payload) "." base64url(hmac_tag)` where the payload is
//! a canonical (fixed field order) JSON encoding of the token record.

pub mod registry;
pub mod service;
pub mod wire;

pub use registry::{TokenRecord, TokenRegistry, spawn_reaper};
pub use service::{MintedToken, TokenService, ValidatedToken};
pub use wire::TokenPayload;

use serde::{Deserialize, Serialize};

use crate::crypto;

/// The (tools, actions, permissions) surface a token authorizes.
///
/// Stored sorted and deduplicated so the canonical encoding and the scope
/// hash are stable regardless of the order the caller supplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Tool ids the token may reach
    pub tools: Vec<String>,
    /// Action ids the token may invoke
    pub actions: Vec<String>,
    /// Permission strings (e.g. `read`, `write`)
    pub permissions: Vec<String>,
}

impl Scope {
    /// Build a scope, normalizing each list to sorted unique entries.
    #[must_use]
    pub fn new(tools: Vec<String>, actions: Vec<String>, permissions: Vec<String>) -> Self {
        Self {
            tools: normalize(tools),
            actions: normalize(actions),
            permissions: normalize(permissions),
        }
    }

    /// Whether the scope covers a tool.
    #[must_use]
    pub fn allows_tool(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t == tool)
    }

    /// Whether the scope covers an action.
    #[must_use]
    pub fn allows_action(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a == action)
    }

    /// Whether the scope carries a permission string.
    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    /// Stable hash over the normalized scope, mixed into request
    /// fingerprints so differently-scoped tokens never share cache entries.
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        crypto::hash(&canonical)
    }
}

fn normalize(mut items: Vec<String>) -> Vec<String> {
    items.sort();
    items.dedup();
    items
}
