//! Read-only cluster verification.
//!
//! Five independent checks, each producing a [`StepResult`]: coordinator
//! reachability, the sharding extension, active worker count, shard
//! placement spread, and a trivial write/read round trip. A failing check
//! never stops the others.

use crate::config::ClusterConfig;
use crate::db::CoordinatorClient;
use crate::error::Result;
use crate::types::{StepResult, StepStatus};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Outcome of a verification pass.
#[derive(Debug)]
pub struct VerificationReport {
    pub checks: Vec<StepResult>,
}

impl VerificationReport {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.status == StepStatus::Pass)
    }

    pub fn failed(&self) -> Vec<&StepResult> {
        self.checks
            .iter()
            .filter(|c| c.status == StepStatus::Fail)
            .collect()
    }
}

/// Runs the read-only verification suite.
pub struct ClusterVerifier {
    db: Arc<dyn CoordinatorClient>,
    cluster: ClusterConfig,
}

impl ClusterVerifier {
    pub fn new(db: Arc<dyn CoordinatorClient>, cluster: ClusterConfig) -> Self {
        Self { db, cluster }
    }

    /// Run all checks. Individual failures land in the report, not in `Err`.
    pub async fn verify(&self) -> Result<VerificationReport> {
        let checks = vec![
            self.check_coordinator().await,
            self.check_extension().await,
            self.check_workers().await,
            self.check_placements().await,
            self.check_roundtrip().await,
        ];

        let report = VerificationReport { checks };
        info!(
            passed = report.checks.iter().filter(|c| c.status == StepStatus::Pass).count(),
            failed = report.failed().len(),
            "Verification finished"
        );
        Ok(report)
    }

    async fn check_coordinator(&self) -> StepResult {
        let start = Instant::now();
        match self.db.ping().await {
            Ok(()) => StepResult::pass(
                "verify.coordinator",
                "coordinator answers queries",
                start.elapsed(),
            ),
            Err(e) => StepResult::fail("verify.coordinator", e.to_string(), start.elapsed()),
        }
    }

    async fn check_extension(&self) -> StepResult {
        let start = Instant::now();
        match self.db.extension_version(&self.cluster.extension).await {
            Ok(Some(version)) => StepResult::pass(
                "verify.extension",
                format!("extension '{}' {} loaded", self.cluster.extension, version),
                start.elapsed(),
            ),
            Ok(None) => StepResult::fail(
                "verify.extension",
                format!(
                    "extension '{}' is not installed on the coordinator",
                    self.cluster.extension
                ),
                start.elapsed(),
            ),
            Err(e) => StepResult::fail("verify.extension", e.to_string(), start.elapsed()),
        }
    }

    async fn check_workers(&self) -> StepResult {
        let start = Instant::now();
        match self.db.active_workers().await {
            Ok(workers) if workers.len() >= self.cluster.expected_workers => StepResult::pass(
                "verify.workers",
                format!(
                    "{} active workers (expected at least {})",
                    workers.len(),
                    self.cluster.expected_workers
                ),
                start.elapsed(),
            ),
            Ok(workers) => StepResult::fail(
                "verify.workers",
                format!(
                    "only {} active workers, expected at least {}",
                    workers.len(),
                    self.cluster.expected_workers
                ),
                start.elapsed(),
            ),
            Err(e) => StepResult::fail("verify.workers", e.to_string(), start.elapsed()),
        }
    }

    /// Placements must exist and span more than one node when more than one
    /// worker is expected.
    async fn check_placements(&self) -> StepResult {
        let start = Instant::now();
        match self.db.shard_placements().await {
            Ok(placements) => {
                let total: u64 = placements.iter().map(|p| p.shard_count).sum();
                if total == 0 {
                    StepResult::skipped("verify.placements", "no shard placements to check")
                } else if self.cluster.expected_workers > 1 && placements.len() < 2 {
                    StepResult::fail(
                        "verify.placements",
                        format!("all {} placements sit on a single node", total),
                        start.elapsed(),
                    )
                } else {
                    StepResult::pass(
                        "verify.placements",
                        format!("{} placements across {} nodes", total, placements.len()),
                        start.elapsed(),
                    )
                }
            }
            Err(e) => StepResult::fail("verify.placements", e.to_string(), start.elapsed()),
        }
    }

    async fn check_roundtrip(&self) -> StepResult {
        let start = Instant::now();
        match self.db.roundtrip_check().await {
            Ok(()) => StepResult::pass(
                "verify.roundtrip",
                "write/read round trip succeeded",
                start.elapsed(),
            ),
            Err(e) => StepResult::fail("verify.roundtrip", e.to_string(), start.elapsed()),
        }
    }
}
