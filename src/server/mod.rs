//! Gateway bootstrap and HTTP server.
//!
//! Wires every subsystem together from validated configuration, registers
//! the adapter set for the configured mode, starts the background sweepers,
//! and serves the administrative and data-path routes until shutdown.

mod router;

pub use router::{AppState, create_router};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use crate::adapter::{self, AdapterRegistry};
use crate::agent::AgentDirectory;
use crate::cache::FingerprintCache;
use crate::config::{Config, SecretsBackend, UpstreamMode};
use crate::failsafe::BreakerPool;
use crate::metrics::GatewayMetrics;
use crate::policy::{PolicyEngine, QuotaTracker};
use crate::proxy::{FeatureFlags, PipelineConfig, ProxyPipeline};
use crate::secrets::SecretsStore;
use crate::telemetry::TelemetryLog;
use crate::token::{TokenRegistry, TokenService};
use crate::{Error, Result};

/// Interval for the cache, quota, and token-registry sweepers.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The gateway process.
pub struct Gateway {
    config: Config,
    state: Arc<AppState>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl Gateway {
    /// Build every subsystem from validated configuration.
    pub fn new(config: Config) -> Result<Self> {
        let metrics = Arc::new(GatewayMetrics::new());
        let telemetry = Arc::new(TelemetryLog::with_capacity(config.telemetry_capacity));

        let kek = config.kek()?;
        let kek_version = kek.version();
        let secrets = Arc::new(SecretsStore::new(kek, Arc::clone(&telemetry)));

        let agents = Arc::new(AgentDirectory::new());
        let token_registry = Arc::new(TokenRegistry::new());
        let tokens = Arc::new(TokenService::new(
            config.token_hmac_secret.clone().into_bytes(),
            Arc::clone(&token_registry),
            Arc::clone(&agents),
            Arc::clone(&metrics),
            Arc::clone(&telemetry),
            kek_version,
        ));

        let quotas = Arc::new(QuotaTracker::new());
        let policy = Arc::new(PolicyEngine::new(
            config.policy.clone(),
            Arc::clone(&quotas),
            Arc::clone(&metrics),
            Arc::clone(&telemetry),
        ));

        let cache = Arc::new(
            FingerprintCache::new(config.cache.max_entries, config.cache.max_bytes)
                .with_max_waiters(config.cache.max_waiters),
        );
        let breakers = Arc::new(BreakerPool::new(
            config.breaker.clone(),
            config.breaker_overrides.clone(),
            Arc::clone(&metrics),
            Arc::clone(&telemetry),
        ));

        let adapters = Arc::new(AdapterRegistry::new());
        match config.upstream_mode {
            UpstreamMode::Mock => {
                let chaos = if config.features.chaos {
                    config.chaos_fraction
                } else {
                    0.0
                };
                adapter::register_builtin_mocks(&adapters, chaos);
                seed_mock_credentials(&secrets)?;
                info!(chaos_fraction = chaos, "Registered mock adapters");
            }
            UpstreamMode::Live => {
                let client = reqwest::Client::builder()
                    .timeout(config.http_timeout)
                    .build()
                    .map_err(|e| Error::Config(format!("HTTP client: {e}")))?;
                adapter::register_builtin_live(
                    &adapters,
                    client,
                    config.policy.fetch.max_response_bytes,
                );
                info!("Registered live adapters");
            }
        }
        seed_env_credentials(&config, &secrets)?;

        let pipeline = Arc::new(ProxyPipeline::new(
            Arc::clone(&tokens),
            Arc::clone(&policy),
            Arc::clone(&cache),
            Arc::clone(&breakers),
            Arc::clone(&secrets),
            Arc::clone(&adapters),
            Arc::clone(&metrics),
            Arc::clone(&telemetry),
            PipelineConfig {
                flags: FeatureFlags {
                    cache: config.features.cache,
                    retry: config.features.retry,
                    breakers: config.features.breakers,
                    policy: config.features.policy,
                },
                attempt_timeout: config.http_timeout,
                total_deadline: config.pipeline.total_deadline,
                cache_ttl: config.cache.default_ttl,
                tool_cache_ttls: config.cache.tool_ttls.clone(),
                max_concurrency: config.pipeline.max_concurrency,
                retry: config.retry.clone(),
            },
        ));

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        crate::token::spawn_reaper(
            Arc::clone(&token_registry),
            SWEEP_INTERVAL,
            shutdown_tx.subscribe(),
        );
        crate::cache::spawn_sweeper(
            Arc::clone(&cache),
            SWEEP_INTERVAL,
            shutdown_tx.subscribe(),
        );
        crate::policy::spawn_sweeper(quotas, SWEEP_INTERVAL, shutdown_tx.subscribe());

        let state = Arc::new(AppState {
            roles: config.roles.clone(),
            agents,
            tokens,
            secrets,
            pipeline,
            metrics,
            telemetry,
        });

        Ok(Self {
            config,
            state,
            shutdown_tx,
        })
    }

    /// Shared state handle (used by in-process tests).
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Serve until ctrl-c.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let router = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("Cannot bind {addr}: {e}")))?;
        info!(%addr, "Gateway listening");

        let shutdown_tx = self.shutdown_tx.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                let _ = shutdown_tx.send(());
            })
            .await
            .map_err(|e| Error::Internal(format!("server error: {e}")))?;

        info!("Gateway shutdown complete");
        Ok(())
    }
}

/// In mock mode every built-in tool gets a synthetic active credential so
/// the full pipeline (including the secrets leg) runs without provisioning.
fn seed_mock_credentials(secrets: &SecretsStore) -> Result<()> {
    for (tool, _) in adapter::BUILTIN_ROUTES {
        let id = secrets.put(
            tool,
            1,
            format!("mock-credential-{tool}").as_bytes(),
            serde_json::json!({"seeded": "mock"}),
            "bootstrap",
        )?;
        secrets.activate(id, "bootstrap")?;
    }
    Ok(())
}

/// With the `env` secrets backend, `CRED_<TOOL>` variables seed and activate
/// version 1 of each named tool's credential. The `vault` backend leaves
/// provisioning to the admin API (the vault sidecar is a collaborator).
fn seed_env_credentials(config: &Config, secrets: &SecretsStore) -> Result<()> {
    if config.secrets_backend != SecretsBackend::Env {
        info!("Secrets backend leaves credential provisioning to the admin API");
        return Ok(());
    }
    for (tool, _) in adapter::BUILTIN_ROUTES {
        let var = format!("CRED_{}", tool.to_uppercase());
        if let Ok(value) = std::env::var(&var) {
            match secrets.put(
                tool,
                1,
                value.as_bytes(),
                serde_json::json!({"seeded": "env"}),
                "bootstrap",
            ) {
                Ok(id) => secrets.activate(id, "bootstrap")?,
                // Mock seeding may already hold version 1; env wins only
                // for tools it introduces.
                Err(Error::Validation(_)) => {
                    warn!(tool, "Credential already provisioned, skipping env seed");
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
