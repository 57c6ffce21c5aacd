//! Tabsync command-line simulator

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use tabsync_cli::cli::{Cli, Commands};
use tabsync_cli::{simulate, CliError, SimulationOptions};
use tabsync_core::TabsyncConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = load_configuration(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate {
            tabs,
            toggle,
            parameter,
        } => {
            info!(tabs, toggle, ?parameter, "Starting simulation");
            let report = simulate(
                config.clone(),
                SimulationOptions {
                    tabs,
                    toggle,
                    parameter,
                },
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.converged {
                return Err(CliError::NotConverged(config.bus.response_timeout_ms).into());
            }
        }
        Commands::Config => {
            let rendered = TabsyncConfig::default()
                .to_toml_string()
                .map_err(CliError::from)?;
            print!("{}", rendered);
        }
    }

    Ok(())
}

/// Log to stderr so stdout stays machine-readable
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_configuration(path: Option<&str>) -> anyhow::Result<TabsyncConfig> {
    match path {
        Some(path) => {
            debug!(path, "Loading configuration");
            let config = TabsyncConfig::load_from_file(path)
                .with_context(|| format!("failed to load configuration from {}", path))?;
            Ok(config)
        }
        None => Ok(TabsyncConfig::default()),
    }
}
