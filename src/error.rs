//! Error types for shardpilot operations.
//!
//! All components share a single [`PilotError`] enum and the [`Result`]
//! alias. Errors fall into three classes:
//!
//! - **Transient**: the operation may succeed if retried (connection refused,
//!   service still initializing, lock contention, timeouts). Retried by the
//!   health poller up to a bounded attempt count.
//! - **Permanent**: retrying cannot help (malformed hostname, missing column,
//!   blocked drain). Recorded and surfaced immediately.
//! - **Fatal**: the entire run must abort before any further stateful action
//!   (control plane unreachable, prerequisite missing, destructive step not
//!   confirmed, user interrupt).
//!
//! Classification lives on the error itself via [`PilotError::is_transient`]
//! and [`PilotError::is_fatal`] so that retry loops never have to pattern
//! match on message text.

use std::io;
use thiserror::Error;

/// Main error type for shardpilot operations.
#[derive(Error, Debug)]
pub enum PilotError {
    // Transient conditions
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Lock contention: {0}")]
    LockContention(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    // Permanent conditions
    #[error("Invalid hostname: {0}")]
    InvalidHostname(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Column {column} not found on table {table}")]
    ColumnNotFound { table: String, column: String },

    #[error("Drain blocked by tables without a primary key: {}", tables.join(", "))]
    DrainBlocked { tables: Vec<String> },

    #[error("Rebalance failed: {0}")]
    RebalanceFailed(String),

    #[error("Command failed with exit code {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },

    #[error("Unexpected query result: {0}")]
    UnexpectedResult(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Fatal conditions
    #[error("Control plane unreachable: {0}")]
    ControlPlaneUnreachable(String),

    #[error("Missing prerequisites: {0}")]
    PrerequisiteMissing(String),

    #[error("Destructive action requires explicit confirmation: {0}")]
    ConfirmationRequired(String),

    #[error("Run interrupted")]
    Interrupted,

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PilotError {
    /// Check whether the error is transient and worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PilotError::ConnectionRefused(_)
                | PilotError::NotReady(_)
                | PilotError::LockContention(_)
                | PilotError::Timeout(_)
        )
    }

    /// Check whether the error must abort the entire run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PilotError::ControlPlaneUnreachable(_)
                | PilotError::PrerequisiteMissing(_)
                | PilotError::ConfirmationRequired(_)
                | PilotError::Interrupted
        )
    }
}

impl From<serde_json::Error> for PilotError {
    fn from(e: serde_json::Error) -> Self {
        PilotError::Serialization(e.to_string())
    }
}

/// Result type alias for shardpilot operations.
pub type Result<T> = std::result::Result<T, PilotError>;
