//! Agent directory: identities that hold tokens instead of credentials.
//!
//! Each agent owns an RSA keypair; the private half is surfaced to the
//! creator exactly once at creation and never stored in decryptable form.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto;
use crate::{Error, Result};

/// Whether an agent may obtain and use tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// May mint tokens and invoke tools
    Active,
    /// Disabled; all tokens cascade-revoked, validation fails
    Disabled,
}

/// An agent identity record.
#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    /// Opaque 128-bit identity
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Role used by the policy engine
    pub role: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// SPKI PEM public key
    pub public_key_pem: String,
    /// Current status
    pub status: AgentStatus,
    /// Tools this agent may ever be scoped to
    pub allowed_tools: Vec<String>,
}

impl Agent {
    /// Whether a requested tool set is within this agent's allowed surface.
    #[must_use]
    pub fn allows_tools(&self, tools: &[String]) -> bool {
        tools.iter().all(|t| self.allowed_tools.contains(t))
    }
}

/// In-memory agent directory.
pub struct AgentDirectory {
    agents: DashMap<Uuid, Agent>,
}

impl AgentDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    /// Create an agent with a fresh RSA-2048 keypair.
    ///
    /// Returns the record and the private key PEM; the private key is not
    /// retained anywhere else.
    pub fn create(
        &self,
        name: &str,
        role: &str,
        allowed_tools: Vec<String>,
    ) -> Result<(Agent, Zeroizing<String>)> {
        if name.trim().is_empty() {
            return Err(Error::Validation("agent name must not be empty".into()));
        }
        let keypair = crypto::generate_agent_keypair()?;
        let agent = Agent {
            id: Uuid::new_v4(),
            name: name.to_string(),
            role: role.to_string(),
            created_at: Utc::now(),
            public_key_pem: keypair.public_pem,
            status: AgentStatus::Active,
            allowed_tools,
        };
        self.agents.insert(agent.id, agent.clone());
        Ok((agent, keypair.private_pem))
    }

    /// Insert a pre-built record. Used by tests and fixtures.
    pub fn insert(&self, agent: Agent) {
        self.agents.insert(agent.id, agent);
    }

    /// Look up an agent by id.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Agent> {
        self.agents.get(&id).map(|entry| entry.clone())
    }

    /// Mark an agent disabled. Idempotent.
    ///
    /// The caller is responsible for cascade-revoking the agent's tokens.
    pub fn disable(&self, id: Uuid) -> Result<Agent> {
        let mut entry = self
            .agents
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("agent {id}")))?;
        entry.status = AgentStatus::Disabled;
        Ok(entry.clone())
    }

    /// All agents, unordered.
    #[must_use]
    pub fn list(&self) -> Vec<Agent> {
        self.agents.iter().map(|entry| entry.clone()).collect()
    }
}

impl Default for AgentDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn make_agent(role: &str, allowed_tools: &[&str]) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: "test-agent".to_string(),
            role: role.to_string(),
            created_at: Utc::now(),
            public_key_pem: "-----BEGIN PUBLIC KEY-----\n-----END PUBLIC KEY-----\n".to_string(),
            status: AgentStatus::Active,
            allowed_tools: allowed_tools.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn allows_tools_checks_subset() {
        let agent = make_agent("researcher", &["serpapi", "http_fetch"]);
        assert!(agent.allows_tools(&["serpapi".to_string()]));
        assert!(agent.allows_tools(&["serpapi".to_string(), "http_fetch".to_string()]));
        assert!(!agent.allows_tools(&["gmail_send".to_string()]));
        assert!(agent.allows_tools(&[]));
    }

    #[test]
    fn disable_is_idempotent_and_visible() {
        let dir = AgentDirectory::new();
        let agent = make_agent("researcher", &["serpapi"]);
        let id = agent.id;
        dir.insert(agent);

        dir.disable(id).unwrap();
        dir.disable(id).unwrap();
        assert_eq!(dir.get(id).unwrap().status, AgentStatus::Disabled);
    }

    #[test]
    fn disable_unknown_agent_is_not_found() {
        let dir = AgentDirectory::new();
        assert!(matches!(dir.disable(Uuid::new_v4()), Err(Error::NotFound(_))));
    }

    #[test]
    fn create_rejects_empty_name() {
        let dir = AgentDirectory::new();
        assert!(matches!(
            dir.create("  ", "researcher", vec![]),
            Err(Error::Validation(_))
        ));
    }
}
