//! fleetd: the fleetscale daemon.
//!
//! Single binary that assembles one fleet's capacity manager:
//! - Fleet backend (simulated, in-memory)
//! - Node registry
//! - Reconciliation engine loop
//! - Idle retention loop
//! - REST API
//!
//! # Usage
//!
//! ```text
//! fleetd init --fleet-id sfr-0123 fleet.toml
//! fleetd run --config fleet.toml
//! ```

mod daemon;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use fleetscale_core::FleetConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,fleetd=debug,fleetscale=debug";

#[derive(Parser)]
#[command(name = "fleetd", about = "fleetscale daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reconcile loop, idle retention and the API server.
    Run {
        /// Path to fleet.toml.
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        /// Listen address; overrides `[daemon] listen`.
        #[arg(long)]
        listen: Option<String>,
    },

    /// Write a starter fleet.toml for a simulated fleet.
    Init {
        /// Where to write the file.
        #[arg(default_value = "fleet.toml")]
        path: PathBuf,

        #[arg(long)]
        fleet_id: String,

        #[arg(long, default_value = "us-east-1")]
        region: String,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Run { config, listen } => {
            let fleet_config = FleetConfig::from_file(&config)
                .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", config.display()))?;
            info!(path = %config.display(), fleet_id = %fleet_config.fleet.id, "configuration loaded");
            daemon::run(fleet_config, listen).await
        }
        Command::Init {
            path,
            fleet_id,
            region,
            force,
        } => init_config(&path, &fleet_id, &region, force),
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn init_config(path: &Path, fleet_id: &str, region: &str, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    let config = FleetConfig::scaffold(fleet_id, region);
    std::fs::write(path, config.to_toml_string()?)?;
    info!(path = %path.display(), %fleet_id, "wrote fleet configuration");
    Ok(())
}
