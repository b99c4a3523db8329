#![warn(missing_docs)]

//! `sitesync` command line.

use anyhow::Result;
use clap::Parser;
use sitesync_repl::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    if cli.log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    tracing::debug!(command = ?cli.command, "sitesync starting");
    cli.run()
}
