//! Core data model shared across shardpilot components.
//!
//! Cluster nodes and their state machine, the append-only registration
//! attempt log, point-in-time shard placement snapshots, primary-key fix
//! requests, and the step results that every run aggregates into a report.

use crate::error::{PilotError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Accepts client queries and routes work across workers.
    Coordinator,
    /// Holds a partition of the data.
    Worker,
}

/// Lifecycle state of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Known from configuration but not yet part of the active node set.
    Unregistered,
    /// A registration attempt is in flight.
    Registering,
    /// Part of the active node set.
    Active,
    /// Shard placements are being evacuated off this node.
    Draining,
    /// Removed from the active set or registration gave up.
    Failed,
}

/// A node discovered from configuration.
///
/// State transitions are restricted: a node becomes `Active` only through
/// `Registering` (a successful registration attempt), enters `Draining` only
/// from `Active`, and a `Draining` or `Failed` node must go through a fresh
/// registration to become `Active` again. There is no implicit resurrection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    pub role: NodeRole,
    pub host: String,
    pub port: u16,
    pub state: NodeState,
}

impl ClusterNode {
    /// Create a node in the `Unregistered` state.
    pub fn new(role: NodeRole, host: impl Into<String>, port: u16) -> Self {
        Self {
            role,
            host: host.into(),
            port,
            state: NodeState::Unregistered,
        }
    }

    /// `host:port` form used in logs and attempt records.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Transition to a new state, enforcing the allowed edges.
    pub fn transition(&mut self, to: NodeState) -> Result<()> {
        use NodeState::*;
        let allowed = matches!(
            (self.state, to),
            (Unregistered, Registering)
                | (Registering, Active)
                | (Registering, Failed)
                | (Active, Draining)
                | (Active, Failed)
                | (Draining, Failed)
                // Re-entry requires a fresh registration attempt.
                | (Draining, Registering)
                | (Failed, Registering)
        );
        if !allowed {
            return Err(PilotError::InvalidState(format!(
                "node {} cannot transition {:?} -> {:?}",
                self.address(),
                self.state,
                to
            )));
        }
        self.state = to;
        Ok(())
    }
}

impl fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} ({:?})", self.role, self.address(), self.state)
    }
}

/// Outcome of a single registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

/// One entry in a node's append-only registration log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationAttempt {
    /// `host:port` of the node being registered.
    pub node: String,
    /// 1-based attempt number; bounded by the configured max attempts.
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    /// Free-text cause for failures, or a note such as "already registered".
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RegistrationAttempt {
    pub fn new(node: impl Into<String>, attempt_number: u32, outcome: AttemptOutcome) -> Self {
        Self {
            node: node.into(),
            attempt_number,
            outcome,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Immutable point-in-time read of shard placements on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardPlacementSnapshot {
    /// `host` (as reported by the coordinator) owning the placements.
    pub node: String,
    pub shard_count: u64,
    pub captured_at: DateTime<Utc>,
}

impl ShardPlacementSnapshot {
    pub fn new(node: impl Into<String>, shard_count: u64) -> Self {
        Self {
            node: node.into(),
            shard_count,
            captured_at: Utc::now(),
        }
    }
}

/// An allow-listed primary-key repair: add a key on `column` of `table`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkFixRequest {
    pub table: String,
    pub candidate_column: String,
}

impl PkFixRequest {
    pub fn new(table: impl Into<String>, candidate_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            candidate_column: candidate_column.into(),
        }
    }

    /// Parse the `table:column` form used in configuration files.
    pub fn parse(entry: &str) -> Result<Self> {
        match entry.split_once(':') {
            Some((table, column)) if !table.is_empty() && !column.is_empty() => {
                Ok(Self::new(table, column))
            }
            _ => Err(PilotError::Config(format!(
                "invalid pk fix entry '{}', expected table:column",
                entry
            ))),
        }
    }
}

impl fmt::Display for PkFixRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.candidate_column)
    }
}

/// Outcome of a primary-key repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PkFixOutcome {
    /// Nothing to do (table missing, key already present, column missing).
    Skipped { reason: String },
    /// The primary key constraint was added.
    Added,
    /// The ALTER was attempted and rejected by the engine.
    Failed { detail: String },
}

impl PkFixOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        PkFixOutcome::Skipped { reason: reason.into() }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        PkFixOutcome::Failed { detail: detail.into() }
    }

    /// A `Failed` repair blocks the downstream drain; Skipped and Added do not.
    pub fn is_blocking(&self) -> bool {
        matches!(self, PkFixOutcome::Failed { .. })
    }
}

/// Status of one step in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pass,
    Fail,
    Skipped,
}

/// One step outcome, in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub detail: String,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn pass(name: impl Into<String>, detail: impl Into<String>, duration: Duration) -> Self {
        Self::new(name, StepStatus::Pass, detail, duration)
    }

    pub fn fail(name: impl Into<String>, detail: impl Into<String>, duration: Duration) -> Self {
        Self::new(name, StepStatus::Fail, detail, duration)
    }

    pub fn skipped(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(name, StepStatus::Skipped, detail, Duration::ZERO)
    }

    fn new(
        name: impl Into<String>,
        status: StepStatus,
        detail: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            status,
            detail: detail.into(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// An ordered sequence of step results for one invocation.
///
/// At most one `TestRun` exists per process run; it is finalized exactly once
/// and never mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepResult>,
}

impl TestRun {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            steps: Vec::new(),
        }
    }

    /// Append a step result. Ignored (with a warning) after finalization.
    pub fn record(&mut self, step: StepResult) {
        if self.finished_at.is_some() {
            tracing::warn!(step = %step.name, "Step recorded after run was finalized; dropping");
            return;
        }
        tracing::info!(
            step = %step.name,
            status = ?step.status,
            detail = %step.detail,
            "Step completed"
        );
        self.steps.push(step);
    }

    /// Finalize the run. Further `record` calls are no-ops.
    pub fn finalize(&mut self) {
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn passed(&self) -> usize {
        self.steps.iter().filter(|s| s.status == StepStatus::Pass).count()
    }

    pub fn failed(&self) -> usize {
        self.steps.iter().filter(|s| s.status == StepStatus::Fail).count()
    }

    pub fn skipped(&self) -> usize {
        self.steps.iter().filter(|s| s.status == StepStatus::Skipped).count()
    }
}

impl Default for TestRun {
    fn default() -> Self {
        Self::new()
    }
}

/// One availability probe during an outage window.
///
/// Owned exclusively by the failure injector; appended in attempt order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityMeasurement {
    /// 1-based probe index.
    pub attempt_index: u32,
    pub success: bool,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl AvailabilityMeasurement {
    pub fn new(attempt_index: u32, success: bool, latency: Duration) -> Self {
        Self {
            attempt_index,
            success,
            latency_ms: latency.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }
}

/// Availability over a series of measurements: successes / attempts.
pub fn availability(measurements: &[AvailabilityMeasurement]) -> f64 {
    if measurements.is_empty() {
        return 0.0;
    }
    let successes = measurements.iter().filter(|m| m.success).count();
    successes as f64 / measurements.len() as f64
}
