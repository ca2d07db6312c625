//! Shared CLI options for the brain and worker binaries

use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// Coordinator ("brain") options
#[derive(Clone, Debug, Parser)]
#[command(name = "kraken-brain", about = "Kloud Kraken coordinator")]
pub struct BrainOpts {
    /// TOML config file
    #[arg(long, short)]
    pub config: PathBuf,

    /// Override the listen address (host:port)
    #[arg(long)]
    pub listen: Option<String>,

    /// Override the fleet capacity
    #[arg(long)]
    pub capacity: Option<usize>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Worker node options
#[derive(Clone, Debug, Parser)]
#[command(name = "kraken-worker", about = "Kloud Kraken worker node")]
pub struct WorkerOpts {
    /// TOML config file
    #[arg(long, short)]
    pub config: PathBuf,

    /// Override the coordinator address (host:port)
    #[arg(long)]
    pub coordinator: Option<String>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}
