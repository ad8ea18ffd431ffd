//! CodeForge binary entrypoint

use clap::Parser;
use eyre::Result;
use tracing_subscriber::EnvFilter;

use codeforge::cli::{Cli, Command};
use codeforge::config::Config;
use codeforge::daemon::Daemon;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref())?;

    match cli.command {
        Command::Serve => {
            let daemon = Daemon::new(config)?;
            daemon.run().await
        }
    }
}
