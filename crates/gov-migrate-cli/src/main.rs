use std::io;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_env("GOVMIG_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the JSON contract; logs go to stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = gov_migrate_cli::Cli::parse();
    gov_migrate_cli::run_cli(cli)
}
