//! # bundlectl
//!
//! Command-line front end for the bundle controller.
//!
//! ## Commands
//!
//! - `run` replays a manifest of resource changes against an in-memory
//!   cluster and prints the resulting resources
//! - `hash` prints the fingerprint of a resource document's spec
//! - `config` prints the effective configuration
//!
//! ## Configuration
//!
//! `--config <file>` loads TOML; `BUNDLECTL_*` environment variables override
//! individual keys. Logs go to stderr and are filtered with `RUST_LOG`
//! (default `info`), so stdout carries only command output.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;
mod commands;
mod manifest;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    commands::execute_command(cli).await
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
