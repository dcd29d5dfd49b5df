//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Inspect and maintain an asset relay installation.
///
/// Shows the effective configuration, the failure ledger of abandoned
/// transfers, and the per-task event log.
#[derive(Parser, Debug)]
#[command(name = "asset-relay")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (defaults to $XDG_CONFIG_HOME/asset-relay/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Disable colored log output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Inspect or clear the failure ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },
    /// Show the effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show recent task events
    Events {
        /// Number of most recent events to show
        #[arg(short = 'n', long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum LedgerAction {
    /// List abandoned tasks
    Show {
        /// Print raw JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Delete the ledger file
    Clear,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}
