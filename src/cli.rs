//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// bundlectl - Bundle controller
#[derive(Parser, Debug)]
#[command(name = "bundlectl")]
#[command(version)]
#[command(about = "Drive bundle provision and update operations from custom resource changes")]
#[command(
    long_about = "bundlectl watches Bundle resources, records a fingerprint of each spec in the resource status, and runs provision or update operations only when that fingerprint changes. Operation progress is written back to the resource status as it happens."
)]
pub struct Cli {
    /// Controller configuration file (TOML)
    #[arg(short, long, global = true, env = "BUNDLECTL_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay a manifest of resource changes through the controller
    Run {
        /// Manifest file: a YAML list of `apply` / `delete` steps
        #[arg(short, long)]
        manifest: PathBuf,
    },

    /// Print the parameter fingerprint of a resource document
    Hash {
        /// Resource document (YAML or JSON)
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Print the effective configuration as TOML
    Config,
}
