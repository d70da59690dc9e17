//! Token registry — the persistence layer behind the token service.
//!
//! Rows are indexed by token id for O(1) validation and revocation. A
//! background reaper evicts rows whose expiry passed; revocation itself is a
//! flag flip so `revoke` stays idempotent even after the row would have
//! expired naturally.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::Scope;

/// A registry row for one issued token.
#[derive(Debug, Clone, Serialize)]
pub struct TokenRecord {
    /// Token id
    pub id: Uuid,
    /// Owning agent
    pub agent_id: Uuid,
    /// Authorized surface at issue time
    pub scope: Scope,
    /// Issue instant
    pub issued_at: DateTime<Utc>,
    /// Expiry instant (inclusive)
    pub expires_at: DateTime<Utc>,
    /// Whether the token was revoked
    pub revoked: bool,
    /// Provenance: KEK version at issue time
    pub kek_version: u32,
    /// Provenance: issuer identity (admin surface name)
    pub issued_by: String,
}

impl TokenRecord {
    /// Whether the row's expiry has passed (exclusive of the boundary).
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// In-memory token registry.
pub struct TokenRegistry {
    by_id: DashMap<Uuid, TokenRecord>,
}

impl TokenRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
        }
    }

    /// Insert a newly minted token row.
    pub fn insert(&self, record: TokenRecord) {
        self.by_id.insert(record.id, record);
    }

    /// Look up a row by token id.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<TokenRecord> {
        self.by_id.get(&id).map(|entry| entry.clone())
    }

    /// Mark a token revoked. Idempotent.
    ///
    /// Returns `true` if the row existed (revoked or not).
    pub fn revoke(&self, id: Uuid) -> bool {
        match self.by_id.get_mut(&id) {
            Some(mut entry) => {
                entry.revoked = true;
                true
            }
            None => false,
        }
    }

    /// Revoke every token owned by an agent (cascade on disable).
    ///
    /// Returns the number of rows newly revoked.
    pub fn revoke_for_agent(&self, agent_id: Uuid) -> usize {
        let mut revoked = 0;
        for mut entry in self.by_id.iter_mut() {
            if entry.agent_id == agent_id && !entry.revoked {
                entry.revoked = true;
                revoked += 1;
            }
        }
        revoked
    }

    /// Rows for one agent, or all rows when `agent_id` is `None`.
    #[must_use]
    pub fn list(&self, agent_id: Option<Uuid>) -> Vec<TokenRecord> {
        let mut rows: Vec<TokenRecord> = self
            .by_id
            .iter()
            .filter(|entry| agent_id.is_none_or(|id| entry.agent_id == id))
            .map(|entry| entry.clone())
            .collect();
        rows.sort_by_key(|r| r.issued_at);
        rows
    }

    /// Remove expired rows. Returns the number removed.
    pub fn reap_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<Uuid> = self
            .by_id
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.id)
            .collect();
        let count = expired.len();
        for id in expired {
            self.by_id.remove(&id);
        }
        count
    }

    /// Current row count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the registry holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a background task that reaps expired rows every `interval`.
///
/// The task exits when the `shutdown` receiver fires. A panic inside one
/// sweep is caught by the task boundary and terminates only the reaper.
pub fn spawn_reaper(
    registry: Arc<TokenRegistry>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = registry.reap_expired();
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired tokens");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Token reaper shutting down");
                    break;
                }
            }
        }
    });
}
