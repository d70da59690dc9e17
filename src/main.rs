//! toolgate - zero-trust API gateway for autonomous agents

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use toolgate::{Error, cli::Cli, config::Config, server::Gateway, setup_tracing};

/// Usage error (bad flags)
const EXIT_USAGE: u8 = 1;
/// Configuration error (missing/invalid required variables)
const EXIT_CONFIG: u8 = 2;
/// Runtime failure
const EXIT_RUNTIME: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    // Env files load before configuration is read
    dotenvy::dotenv().ok();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap prints its own help/version output on these paths
            if e.use_stderr() {
                eprintln!("{e}");
                return ExitCode::from(EXIT_USAGE);
            }
            print!("{e}");
            return ExitCode::SUCCESS;
        }
    };

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::from(EXIT_RUNTIME);
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        mode = ?config.upstream_mode,
        "Starting toolgate"
    );

    let gateway = match Gateway::new(config) {
        Ok(gateway) => gateway,
        Err(e @ Error::Config(_)) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::from(EXIT_RUNTIME);
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::from(EXIT_RUNTIME);
    }

    ExitCode::SUCCESS
}
