//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tabsync", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run background, popup and tab contexts over a loopback network
    Simulate {
        /// Number of tab contexts to open
        #[arg(short, long, default_value_t = 3)]
        tabs: u32,
        /// Toggle the feature from the popup
        #[arg(long)]
        toggle: bool,
        /// Set the feature parameter from the popup
        #[arg(short, long)]
        parameter: Option<f64>,
    },
    /// Print the default configuration as TOML
    Config,
}
