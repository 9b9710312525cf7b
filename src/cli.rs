//! Command-line interface for shardpilot.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// shardpilot - bootstrap and failure-test a sharded database cluster.
#[derive(Parser)]
#[command(name = "shardpilot")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "SHARDPILOT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "SHARDPILOT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit JSON logs
    #[arg(long, env = "SHARDPILOT_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Check prerequisites, configure the coordinator, and register workers
    Bootstrap,

    /// Run the read-only verification suite
    Verify,

    /// Rebalance shard placements across active workers
    Rebalance,

    /// Drain all shard placements off a worker
    Drain {
        /// Worker host to drain (must match a configured worker)
        node: String,
    },

    /// Kill a worker pod and measure availability, integrity, and recovery
    HaTest {
        /// Worker host to target (defaults to the first configured worker)
        #[arg(long)]
        target: Option<String>,

        /// Confirm the destructive pod deletion
        #[arg(long)]
        yes: bool,
    },

    /// Show version information
    Version,
}
