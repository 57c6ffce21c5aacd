//! Error handling for the tabsync CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Tabsync error: {0}")]
    Tabsync(#[from] tabsync_core::TabsyncError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Contexts did not converge within {0}ms")]
    NotConverged(u64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
