use std::str::FromStr;

use anyhow::Context;
use clap::Parser;
use ferry_storage::FerryConfig;
use tracing::level_filters::LevelFilter;

mod cli;
mod commands;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    let mut config = FerryConfig::load(cli.config.as_deref())?;
    if let Some(path) = &cli.repo_path {
        config.repo.path = path.clone();
        config.validate()?;
    }

    // stdout carries the protocol under `ferry remote`; logs always go to stderr.
    let level = match (&cli.log_level, cli.verbose) {
        (Some(level), _) => level.as_str(),
        (None, true) => "debug",
        (None, false) => config.log_level.as_str(),
    };
    let level = LevelFilter::from_str(level).with_context(|| format!("invalid log level '{level}'"))?;
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();

    commands::run_command(cli, config).await
}
