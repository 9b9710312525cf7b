//! Shard rebalancing and node draining.
//!
//! Both operations move data, so they run strictly one at a time through a
//! small state machine. A drain refuses to start while any distributed table
//! lacks a primary key; the blocking tables are named in the error instead
//! of letting the engine fail mid-move.

use crate::config::{NodeEndpoint, RepairConfig};
use crate::db::CoordinatorClient;
use crate::error::{PilotError, Result};
use crate::repair::{PkFixReport, SchemaRepairer};
use crate::types::ShardPlacementSnapshot;
use std::sync::Arc;
use tracing::{info, warn};

/// Phase of the move orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovePhase {
    /// No data movement in progress.
    Idle,
    /// A cluster-wide rebalance is running.
    Rebalancing,
    /// A node drain is running.
    Draining,
    /// A drain completed; the node's placements are gone.
    Done,
}

/// Result of a completed drain.
#[derive(Debug)]
pub struct DrainReport {
    pub node: NodeEndpoint,
    /// Repairs applied before the drain (empty when none were configured).
    pub repairs: Vec<PkFixReport>,
    /// Placement snapshot after the drain.
    pub placements: Vec<ShardPlacementSnapshot>,
}

/// Serializes rebalance and drain operations.
pub struct RebalanceDrainOrchestrator {
    db: Arc<dyn CoordinatorClient>,
    repairer: SchemaRepairer,
    repair: RepairConfig,
    phase: MovePhase,
}

impl RebalanceDrainOrchestrator {
    pub fn new(db: Arc<dyn CoordinatorClient>, repair: RepairConfig) -> Self {
        let repairer = SchemaRepairer::new(Arc::clone(&db));
        Self {
            db,
            repairer,
            repair,
            phase: MovePhase::Idle,
        }
    }

    pub fn phase(&self) -> MovePhase {
        self.phase
    }

    fn begin(&mut self, next: MovePhase) -> Result<()> {
        if self.phase == MovePhase::Rebalancing || self.phase == MovePhase::Draining {
            return Err(PilotError::InvalidState(format!(
                "a data move is already in progress ({:?})",
                self.phase
            )));
        }
        self.phase = next;
        Ok(())
    }

    /// Rebalance shard placements across the active worker set.
    pub async fn rebalance(&mut self) -> Result<Vec<ShardPlacementSnapshot>> {
        self.begin(MovePhase::Rebalancing)?;
        info!("Starting shard rebalance");

        let result = self.db.rebalance_shards().await;
        match result {
            Ok(()) => {
                // Back to Idle so a drain can follow in the same run.
                self.phase = MovePhase::Idle;
                let placements = self.db.shard_placements().await?;
                info!(nodes = placements.len(), "Rebalance complete");
                Ok(placements)
            }
            Err(e) => {
                self.phase = MovePhase::Idle;
                warn!(error = %e, "Rebalance failed");
                Err(PilotError::RebalanceFailed(e.to_string()))
            }
        }
    }

    /// Drain all shard placements off a node.
    ///
    /// Runs the primary-key allow-list first, then re-checks that no
    /// distributed table is missing a replica identity. Any remaining table
    /// blocks the drain before data starts moving.
    pub async fn drain(&mut self, node: &NodeEndpoint) -> Result<DrainReport> {
        self.begin(MovePhase::Draining)?;
        info!(node = %node.address(), "Starting node drain");

        let result = self.drain_inner(node).await;
        match result {
            Ok(report) => {
                self.phase = MovePhase::Done;
                info!(node = %node.address(), "Drain complete");
                Ok(report)
            }
            Err(e) => {
                self.phase = MovePhase::Idle;
                warn!(node = %node.address(), error = %e, "Drain failed");
                Err(e)
            }
        }
    }

    async fn drain_inner(&self, node: &NodeEndpoint) -> Result<DrainReport> {
        let repairs = self.repairer.repair_all(&self.repair.pk_fix_list).await?;
        for report in repairs.iter().filter(|r| r.outcome.is_blocking()) {
            warn!(table = %report.request.table, "Allow-listed repair failed before drain");
        }

        let blocked = self.db.tables_missing_replica_identity().await?;
        if !blocked.is_empty() {
            return Err(PilotError::DrainBlocked { tables: blocked });
        }

        self.db.drain_node(&node.host, node.port).await?;

        let placements = self.db.shard_placements().await?;
        if let Some(remaining) = placements.iter().find(|p| p.node == node.host) {
            if remaining.shard_count > 0 {
                return Err(PilotError::UnexpectedResult(format!(
                    "node {} still holds {} shard placements after drain",
                    node.host, remaining.shard_count
                )));
            }
        }

        Ok(DrainReport {
            node: node.clone(),
            repairs,
            placements,
        })
    }
}
