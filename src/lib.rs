//! shardpilot - bootstrap and failure-test a sharded relational cluster.
//!
//! A cluster here is one coordinator plus N workers running a sharding
//! extension. shardpilot drives the cluster from outside, through the
//! container runtime and the coordinator's SQL surface.
//!
//! # What it does
//!
//! - **Bootstrap**: check prerequisites, point the metadata at the
//!   coordinator, register every worker with bounded retries.
//! - **Verify**: read-only checks of reachability, worker count, shard
//!   placement spread, and a write/read round trip.
//! - **Rebalance / Drain**: serialized data movement, with an allow-listed
//!   primary-key repair pass before draining.
//! - **HA test**: kill a worker pod, measure availability through the
//!   outage, then check recovery, data integrity, and re-registration.
//!
//! Every run ends in a step table on stdout and a JSON artifact on disk.
//!
//! # Quick Start
//!
//! ```no_run
//! use shardpilot::config::PilotConfig;
//!
//! #[tokio::main]
//! async fn main() -> shardpilot::Result<()> {
//!     let config = PilotConfig::development();
//!     config.validate()?;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod configure;
pub mod db;
pub mod error;
pub mod ha;
pub mod observability;
pub mod poller;
pub mod prereq;
pub mod rebalance;
pub mod repair;
pub mod report;
pub mod runtime;
pub mod shutdown;
pub mod types;
pub mod verify;

pub use error::{PilotError, Result};

/// Version of the shardpilot crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
