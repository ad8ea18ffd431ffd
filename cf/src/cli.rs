//! Command-line interface

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CodeForge control plane
#[derive(Debug, Parser)]
#[command(name = "cf", version, about = "Multi-agent execution orchestrator")]
pub struct Cli {
    /// Path to a configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the control plane in the foreground
    Serve,
}
