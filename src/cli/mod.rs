//! CLI module for kindtest
//!
//! Operator subcommands for out-of-band recovery:
//! - `kindtest cleanup` - Delete every recorded cluster (emergency purge)
//! - `kindtest sweep` - Delete orphaned clusters only
//! - `kindtest list` - Show recorded clusters and whether they still exist

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "kindtest")]
#[command(about = "Manage ephemeral kind clusters left behind by test runs")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to settings file (default: ~/.kindtest/config.yaml)
    #[arg(long, global = true, env = "KINDTEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the shared state file
    #[arg(long, global = true, env = "KINDTEST_STATE_FILE")]
    pub state_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Delete every recorded cluster on this host, including kept ones
    Cleanup,

    /// Delete clusters whose owning test run is gone
    Sweep,

    /// List recorded clusters
    List(ListArgs),
}

/// Arguments for the list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Do not ask kind which clusters still exist
    #[arg(long)]
    pub no_probe: bool,
}
