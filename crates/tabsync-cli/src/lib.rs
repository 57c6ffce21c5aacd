//! Tabsync CLI
//!
//! Runs a background context, a popup and a number of tab contexts in one
//! process, connected by a loopback network, and reports the state they
//! converge to.

pub mod cli;
pub mod error;
pub mod simulation;

pub use error::{CliError, Result};
pub use simulation::{simulate, SimulationOptions, SimulationReport, TabMirror};
