//! Configuration management.
//!
//! Structured configuration (policies, per-route breaker tuning, cache
//! sizing, role definitions) comes from an optional YAML file merged with
//! `TOOLGATE_`-prefixed environment variables via figment. The operational
//! surface of the process — port, secrets, mode, feature toggles — is the
//! set of plainly named environment variables below, read once at startup
//! and validated fail-fast:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `PORT` | listen port |
//! | `DATABASE_URL` | storage connection string (collaborator) |
//! | `REDIS_URL` | optional shared cache/quota backend (collaborator) |
//! | `TOKEN_HMAC_SECRET` | 32+ byte secret for token signatures (required) |
//! | `KEK_BASE64` | base64 of the 32-byte envelope KEK (required) |
//! | `SECRETS_BACKEND` | `env` or `vault` |
//! | `HTTP_TIMEOUT_MS` | default per-attempt upstream timeout |
//! | `UPSTREAM_MODE` | `live` or `mock` |
//! | `FF_CACHE` `FF_RETRY` `FF_BREAKERS` `FF_POLICY` `FF_CHAOS` | feature toggles |

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::crypto::Kek;
use crate::failsafe::{BreakerConfig, RetryPolicy};
use crate::policy::PolicyConfig;
use crate::{Error, Result};

/// Minimum length of the token signing secret, in bytes.
pub const MIN_HMAC_SECRET_LEN: usize = 32;

/// Where upstream credentials are sourced at bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretsBackend {
    /// Seed credentials from the process environment
    Env,
    /// Fetch credentials from a Vault deployment
    Vault,
}

/// Which adapter set is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamMode {
    /// Real upstream providers
    Live,
    /// Synthesized deterministic upstreams
    Mock,
}

/// Server bind configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Feature toggles, all on by default (chaos off).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Response cache + single-flight
    pub cache: bool,
    /// Retry loop
    pub retry: bool,
    /// Circuit breakers
    pub breakers: bool,
    /// Policy engine
    pub policy: bool,
    /// Forced mock failure fraction (mock mode only)
    pub chaos: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            cache: true,
            retry: true,
            breakers: true,
            policy: true,
            chaos: false,
        }
    }
}

/// Cache sizing and TTLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entry count
    pub max_entries: usize,
    /// Maximum total body bytes
    pub max_bytes: usize,
    /// Default response TTL
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// Per-tool TTL overrides
    #[serde(with = "tool_ttls_serde")]
    pub tool_ttls: HashMap<String, Duration>,
    /// Bound on coalesced subscribers per fingerprint
    pub max_waiters: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 64 << 20,
            default_ttl: Duration::from_secs(60),
            tool_ttls: HashMap::new(),
            max_waiters: 64,
        }
    }
}

mod tool_ttls_serde {
    use std::collections::HashMap;
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        map: &HashMap<String, Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let as_secs: HashMap<&String, u64> =
            map.iter().map(|(k, v)| (k, v.as_secs())).collect();
        as_secs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<String, Duration>, D::Error> {
        let as_secs = HashMap::<String, u64>::deserialize(deserializer)?;
        Ok(as_secs
            .into_iter()
            .map(|(k, v)| (k, Duration::from_secs(v)))
            .collect())
    }
}

/// A role an agent can be created with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Tools agents of this role may ever be scoped to
    pub allowed_tools: Vec<String>,
}

/// Pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineTuning {
    /// Per-tool ceiling on total request time
    #[serde(with = "humantime_serde")]
    pub total_deadline: Duration,
    /// Concurrent adapter calls per tool
    pub max_concurrency: usize,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            total_deadline: Duration::from_secs(30),
            max_concurrency: 64,
        }
    }
}

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server bind
    pub server: ServerConfig,
    /// Storage connection string (collaborator; not dialed by the core)
    pub database_url: Option<String>,
    /// Optional shared cache/quota backend (collaborator)
    pub redis_url: Option<String>,
    /// Token signing secret (required, 32+ bytes)
    #[serde(skip_serializing)]
    pub token_hmac_secret: String,
    /// Envelope KEK, base64 of 32 bytes (required)
    #[serde(skip_serializing)]
    pub kek_base64: String,
    /// KEK version stamped into provenance
    pub kek_version: u32,
    /// Credential bootstrap backend
    pub secrets_backend: SecretsBackend,
    /// Adapter mode
    pub upstream_mode: UpstreamMode,
    /// Default per-attempt upstream timeout
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
    /// Feature toggles
    pub features: FeaturesConfig,
    /// Mock failure fraction when chaos is on
    pub chaos_fraction: f64,
    /// Cache sizing
    pub cache: CacheConfig,
    /// Default breaker tuning
    pub breaker: BreakerConfig,
    /// Per-route (`tool:action`) breaker overrides
    pub breaker_overrides: HashMap<String, BreakerConfig>,
    /// Retry schedule
    pub retry: RetryPolicy,
    /// Policy engine configuration
    pub policy: PolicyConfig,
    /// Pipeline tuning
    pub pipeline: PipelineTuning,
    /// Roles agents can be created with
    pub roles: HashMap<String, RoleConfig>,
    /// Telemetry ring capacity
    pub telemetry_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        let mut roles = HashMap::new();
        roles.insert(
            "researcher".to_string(),
            RoleConfig {
                allowed_tools: vec!["serpapi".into(), "http_fetch".into(), "openai".into()],
            },
        );
        roles.insert(
            "operator".to_string(),
            RoleConfig {
                allowed_tools: vec![
                    "serpapi".into(),
                    "http_fetch".into(),
                    "openai".into(),
                    "gmail_send".into(),
                ],
            },
        );
        Self {
            server: ServerConfig::default(),
            database_url: None,
            redis_url: None,
            token_hmac_secret: String::new(),
            kek_base64: String::new(),
            kek_version: 1,
            secrets_backend: SecretsBackend::Env,
            upstream_mode: UpstreamMode::Mock,
            http_timeout: Duration::from_secs(10),
            features: FeaturesConfig::default(),
            chaos_fraction: 0.2,
            cache: CacheConfig::default(),
            breaker: BreakerConfig::default(),
            breaker_overrides: HashMap::new(),
            retry: RetryPolicy::default(),
            policy: PolicyConfig::default(),
            pipeline: PipelineTuning::default(),
            roles,
            telemetry_capacity: 4096,
        }
    }
}

impl Config {
    /// Load configuration: defaults ← YAML file ← `TOOLGATE_*` env ← the
    /// plainly named operational variables. Validates before returning.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }
        figment = figment.merge(Env::prefixed("TOOLGATE_").split("__"));

        let mut config: Config = figment
            .extract()
            .map_err(|e| Error::Config(format!("invalid configuration: {e}")))?;
        config.apply_process_env(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the plainly named environment variables via `lookup`
    /// (injectable for tests).
    pub fn apply_process_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| Error::Config(format!("PORT must be a port number, got {port:?}")))?;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.redis_url = Some(url);
        }
        if let Some(secret) = lookup("TOKEN_HMAC_SECRET") {
            self.token_hmac_secret = secret;
        }
        if let Some(kek) = lookup("KEK_BASE64") {
            self.kek_base64 = kek;
        }
        if let Some(backend) = lookup("SECRETS_BACKEND") {
            self.secrets_backend = match backend.as_str() {
                "env" => SecretsBackend::Env,
                "vault" => SecretsBackend::Vault,
                other => {
                    return Err(Error::Config(format!(
                        "SECRETS_BACKEND must be `env` or `vault`, got {other:?}"
                    )));
                }
            };
        }
        if let Some(timeout) = lookup("HTTP_TIMEOUT_MS") {
            let ms: u64 = timeout.parse().map_err(|_| {
                Error::Config(format!("HTTP_TIMEOUT_MS must be milliseconds, got {timeout:?}"))
            })?;
            self.http_timeout = Duration::from_millis(ms);
        }
        if let Some(mode) = lookup("UPSTREAM_MODE") {
            self.upstream_mode = match mode.as_str() {
                "live" => UpstreamMode::Live,
                "mock" => UpstreamMode::Mock,
                other => {
                    return Err(Error::Config(format!(
                        "UPSTREAM_MODE must be `live` or `mock`, got {other:?}"
                    )));
                }
            };
        }
        for (name, slot) in [
            ("FF_CACHE", &mut self.features.cache as &mut bool),
            ("FF_RETRY", &mut self.features.retry),
            ("FF_BREAKERS", &mut self.features.breakers),
            ("FF_POLICY", &mut self.features.policy),
            ("FF_CHAOS", &mut self.features.chaos),
        ] {
            if let Some(raw) = lookup(name) {
                *slot = parse_bool(name, &raw)?;
            }
        }
        Ok(())
    }

    /// Fail fast on missing or malformed required values.
    pub fn validate(&self) -> Result<()> {
        if self.token_hmac_secret.is_empty() {
            return Err(Error::Config(
                "TOKEN_HMAC_SECRET is required (32+ byte token signing secret)".into(),
            ));
        }
        if self.token_hmac_secret.len() < MIN_HMAC_SECRET_LEN {
            return Err(Error::Config(format!(
                "TOKEN_HMAC_SECRET must be at least {MIN_HMAC_SECRET_LEN} bytes, got {}",
                self.token_hmac_secret.len()
            )));
        }
        if self.kek_base64.is_empty() {
            return Err(Error::Config(
                "KEK_BASE64 is required (base64 of a 32-byte AES key)".into(),
            ));
        }
        // Surfaces both bad base64 and a wrong key length
        Kek::from_base64(&self.kek_base64, self.kek_version)?;
        if !(0.0..=1.0).contains(&self.chaos_fraction) {
            return Err(Error::Config(format!(
                "chaos_fraction must be within [0, 1], got {}",
                self.chaos_fraction
            )));
        }
        if self.http_timeout.is_zero() {
            return Err(Error::Config("HTTP_TIMEOUT_MS must be positive".into()));
        }
        Ok(())
    }

    /// Build the startup KEK from the validated config.
    pub fn kek(&self) -> Result<Kek> {
        Kek::from_base64(&self.kek_base64, self.kek_version)
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(Error::Config(format!(
            "{name} must be a boolean (true/false), got {raw:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_fixture(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + '_ {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| (*v).to_string())
        }
    }

    fn valid_kek() -> String {
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [1u8; 32])
    }

    #[test]
    fn required_vars_validate_fail_fast() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("TOKEN_HMAC_SECRET")));

        let mut config = Config::default();
        config.token_hmac_secret = "short".into();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("at least 32")));

        let mut config = Config::default();
        config.token_hmac_secret = "x".repeat(32);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("KEK_BASE64")));

        config.kek_base64 = "!!not-base64!!".into();
        assert!(config.validate().is_err());

        config.kek_base64 = valid_kek();
        config.validate().unwrap();
    }

    #[test]
    fn process_env_overrides_apply() {
        let kek = valid_kek();
        let secret = "a-32-byte-minimum-signing-secret";
        let mut config = Config::default();
        config
            .apply_process_env(env_fixture(&[
                ("PORT", "9999"),
                ("TOKEN_HMAC_SECRET", secret),
                ("KEK_BASE64", &kek),
                ("UPSTREAM_MODE", "live"),
                ("SECRETS_BACKEND", "vault"),
                ("HTTP_TIMEOUT_MS", "2500"),
                ("FF_CACHE", "false"),
                ("FF_CHAOS", "1"),
            ]))
            .unwrap();

        assert_eq!(config.server.port, 9999);
        assert_eq!(config.upstream_mode, UpstreamMode::Live);
        assert_eq!(config.secrets_backend, SecretsBackend::Vault);
        assert_eq!(config.http_timeout, Duration::from_millis(2500));
        assert!(!config.features.cache);
        assert!(config.features.chaos);
        config.validate().unwrap();
    }

    #[test]
    fn invalid_values_carry_specific_messages() {
        let mut config = Config::default();
        let err = config
            .apply_process_env(env_fixture(&[("PORT", "not-a-port")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("PORT")));

        let err = config
            .apply_process_env(env_fixture(&[("UPSTREAM_MODE", "hybrid")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("UPSTREAM_MODE")));

        let err = config
            .apply_process_env(env_fixture(&[("FF_RETRY", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("FF_RETRY")));
    }

    #[test]
    fn yaml_file_merges_under_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolgate.yaml");
        std::fs::write(
            &path,
            "server:\n  port: 4000\ncache:\n  max_entries: 42\n",
        )
        .unwrap();

        // No process env in play; file values land
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(&path));
        let config: Config = figment.extract().unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.cache.max_entries, 42);
    }

    #[test]
    fn default_roles_cover_builtin_tools() {
        let config = Config::default();
        let operator = &config.roles["operator"];
        assert!(operator.allowed_tools.contains(&"gmail_send".to_string()));
        let researcher = &config.roles["researcher"];
        assert!(!researcher.allowed_tools.contains(&"gmail_send".to_string()));
    }
}
