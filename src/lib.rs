//! toolgate library
//!
//! A zero-trust API gateway mediating calls from autonomous agents to
//! external tools. Agents never hold upstream provider credentials; they
//! obtain short-lived, scope-bound, signed tokens and invoke upstreams
//! through one proxy endpoint.
//!
//! # Subsystems
//!
//! - **Credential & token lifecycle**: envelope-encrypted versioned
//!   credentials, per-agent keypairs, signed revocable tokens
//! - **Policy engine**: scope, role rules, parameter constraints, quotas,
//!   schedules
//! - **Proxy pipeline**: authenticate → authorize → cache → breaker →
//!   retry → adapter → shape → metrics
//! - **Resilience fabric**: per-route circuit breakers, full-jitter retry,
//!   single-flight response cache, Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
pub mod agent;
pub mod cache;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod failsafe;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod secrets;
pub mod server;
pub mod telemetry;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
