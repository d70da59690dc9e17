//! Versioned, envelope-encrypted store for upstream credentials.
//!
//! Credentials are encrypted at rest the moment they enter the store and
//! only decrypted inside a caller-scoped acquisition during adapter
//! invocation. At most one version per tool is active at any instant;
//! activation is atomic and linearizable per tool (activation takes the
//! writer lock, `get_active` the reader lock). A reader that acquired a
//! plaintext before a rotation keeps it for the in-flight call; the next
//! `get_active` sees the new version.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{self, EnvelopeRecord, Kek};
use crate::telemetry::{TelemetryEvent, TelemetryLog};
use crate::{Error, Result};
use std::sync::Arc;

/// One stored credential version. Ciphertext only; plaintext never rests.
struct CredentialVersion {
    id: Uuid,
    version: u64,
    record: EnvelopeRecord,
    active: bool,
    created_at: DateTime<Utc>,
    metadata: Value,
}

/// Administrative view of a stored version.
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    /// Credential id (activation handle)
    pub id: Uuid,
    /// Monotonic version number within the tool
    pub version: u64,
    /// Whether this is the active version
    pub active: bool,
    /// Storage timestamp
    pub created_at: DateTime<Utc>,
    /// KEK version the record is wrapped under
    pub kek_version: u32,
    /// Caller-supplied metadata
    pub metadata: Value,
}

/// A scoped plaintext acquisition.
///
/// The decrypted bytes live only as long as this guard; the buffer is wiped
/// on every exit path, including panics, when the guard drops.
pub struct PlaintextCredential {
    secret: Zeroizing<Vec<u8>>,
    version: u64,
}

impl PlaintextCredential {
    /// Borrow the credential bytes for the upstream call.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.secret
    }

    /// The version this plaintext was decrypted from.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }
}

struct Inner {
    kek: Kek,
    by_tool: HashMap<String, Vec<CredentialVersion>>,
}

/// The process-wide secrets store.
pub struct SecretsStore {
    inner: RwLock<Inner>,
    telemetry: Arc<TelemetryLog>,
}

impl SecretsStore {
    /// Create a store around the startup KEK.
    #[must_use]
    pub fn new(kek: Kek, telemetry: Arc<TelemetryLog>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                kek,
                by_tool: HashMap::new(),
            }),
            telemetry,
        }
    }

    /// KEK version currently wrapping new records.
    #[must_use]
    pub fn kek_version(&self) -> u32 {
        self.inner.read().kek.version()
    }

    /// Store a new credential version for `tool`. Inactive on insert.
    ///
    /// `version` must be strictly greater than every stored version for the
    /// tool; versions are the rotation ordering and never reused.
    pub fn put(
        &self,
        tool: &str,
        version: u64,
        plaintext: &[u8],
        metadata: Value,
        correlation_id: &str,
    ) -> Result<Uuid> {
        if tool.trim().is_empty() {
            return Err(Error::Validation("tool must not be empty".into()));
        }
        let mut inner = self.inner.write();
        let record = crypto::encrypt_envelope(&inner.kek, plaintext)?;
        let versions = inner.by_tool.entry(tool.to_string()).or_default();
        if let Some(max) = versions.iter().map(|v| v.version).max() {
            if version <= max {
                return Err(Error::Validation(format!(
                    "version {version} is not greater than stored version {max} for {tool}"
                )));
            }
        }
        let id = Uuid::new_v4();
        versions.push(CredentialVersion {
            id,
            version,
            record,
            active: false,
            created_at: Utc::now(),
            metadata,
        });
        drop(inner);

        self.telemetry
            .record(TelemetryEvent::credential_stored(correlation_id, tool, version));
        info!(tool, version, "Stored credential version");
        Ok(id)
    }

    /// Atomically activate a stored version, deactivating the prior active
    /// version of the same tool.
    pub fn activate(&self, id: Uuid, correlation_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let (tool, version) = {
            let mut found = None;
            for (tool, versions) in &inner.by_tool {
                if let Some(v) = versions.iter().find(|v| v.id == id) {
                    if v.active {
                        return Err(Error::Validation(format!(
                            "credential {id} is already active"
                        )));
                    }
                    found = Some((tool.clone(), v.version));
                    break;
                }
            }
            found.ok_or_else(|| Error::NotFound(format!("credential {id}")))?
        };

        let versions = inner
            .by_tool
            .get_mut(&tool)
            .ok_or_else(|| Error::NotFound(format!("credential {id}")))?;
        for v in versions.iter_mut() {
            v.active = v.id == id;
        }
        drop(inner);

        self.telemetry.record(TelemetryEvent::credential_activated(
            correlation_id,
            &tool,
            version,
        ));
        info!(tool, version, "Activated credential version");
        Ok(())
    }

    /// Decrypt the active credential for `tool` into a scoped acquisition.
    pub fn get_active(&self, tool: &str) -> Result<PlaintextCredential> {
        let inner = self.inner.read();
        let active = inner
            .by_tool
            .get(tool)
            .and_then(|versions| versions.iter().find(|v| v.active))
            .ok_or_else(|| Error::NotFound(format!("no active credential for {tool}")))?;
        let secret = crypto::decrypt_envelope(&inner.kek, &active.record)?;
        Ok(PlaintextCredential {
            secret,
            version: active.version,
        })
    }

    /// Administrative listing of every stored version for `tool`.
    #[must_use]
    pub fn list_versions(&self, tool: &str) -> Vec<VersionInfo> {
        let inner = self.inner.read();
        let mut versions: Vec<VersionInfo> = inner
            .by_tool
            .get(tool)
            .map(|versions| {
                versions
                    .iter()
                    .map(|v| VersionInfo {
                        id: v.id,
                        version: v.version,
                        active: v.active,
                        created_at: v.created_at,
                        kek_version: v.record.kek_version,
                        metadata: v.metadata.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        versions.sort_by_key(|v| v.version);
        versions
    }

    /// Rewrap every stored record under a new KEK.
    ///
    /// Holds the writer lock for the whole pass so no reader can observe a
    /// mixed state. Returns the number of records rewrapped.
    pub fn rewrap(&self, new_kek: Kek, correlation_id: &str) -> Result<usize> {
        let mut inner = self.inner.write();
        let mut rewrapped: Vec<(String, usize, EnvelopeRecord)> = Vec::new();
        for (tool, versions) in &inner.by_tool {
            for (idx, v) in versions.iter().enumerate() {
                let plaintext = crypto::decrypt_envelope(&inner.kek, &v.record)?;
                let record = crypto::encrypt_envelope(&new_kek, &plaintext)?;
                rewrapped.push((tool.clone(), idx, record));
            }
        }
        let count = rewrapped.len();
        for (tool, idx, record) in rewrapped {
            if let Some(versions) = inner.by_tool.get_mut(&tool) {
                versions[idx].record = record;
            }
        }
        let new_version = new_kek.version();
        inner.kek = new_kek;
        drop(inner);

        self.telemetry.record(TelemetryEvent::kek_rewrapped(
            correlation_id,
            count,
            new_version,
        ));
        info!(records = count, kek_version = new_version, "Rewrapped credentials under new KEK");
        Ok(count)
    }
}
