//! Allow-listed primary-key repair.
//!
//! Draining a node requires every distributed table to have a replica
//! identity. Repairs run only over the explicit `table:column` allow-list
//! from configuration, and only as a pre-step to draining. A table outside
//! the list is never touched.

use crate::db::CoordinatorClient;
use crate::error::Result;
use crate::types::{PkFixOutcome, PkFixRequest};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of one allow-list entry.
#[derive(Debug, Clone)]
pub struct PkFixReport {
    pub request: PkFixRequest,
    pub outcome: PkFixOutcome,
}

/// Applies the configured primary-key fixes.
pub struct SchemaRepairer {
    db: Arc<dyn CoordinatorClient>,
}

impl SchemaRepairer {
    pub fn new(db: Arc<dyn CoordinatorClient>) -> Self {
        Self { db }
    }

    /// Ensure one table has a primary key, adding it on the candidate column
    /// when safe.
    ///
    /// The ladder short-circuits: a missing table, an existing key, or a
    /// missing candidate column is a skip. Only a failed ALTER counts as a
    /// blocking failure.
    pub async fn ensure_primary_key(&self, request: &PkFixRequest) -> Result<PkFixOutcome> {
        if !self.db.table_exists(&request.table).await? {
            return Ok(PkFixOutcome::skipped(format!(
                "table '{}' does not exist",
                request.table
            )));
        }

        if self.db.has_primary_key(&request.table).await? {
            return Ok(PkFixOutcome::skipped(format!(
                "table '{}' already has a primary key",
                request.table
            )));
        }

        if !self
            .db
            .column_exists(&request.table, &request.candidate_column)
            .await?
        {
            warn!(table = %request.table, column = %request.candidate_column,
                "Candidate column missing; skipping primary key repair");
            return Ok(PkFixOutcome::skipped(format!(
                "column '{}' does not exist on '{}'",
                request.candidate_column, request.table
            )));
        }

        match self
            .db
            .add_primary_key(&request.table, &request.candidate_column)
            .await
        {
            Ok(()) => {
                info!(table = %request.table, column = %request.candidate_column,
                    "Primary key added");
                Ok(PkFixOutcome::Added)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(table = %request.table, error = %e, "Primary key repair failed");
                Ok(PkFixOutcome::failed(e.to_string()))
            }
        }
    }

    /// Run every allow-list entry, continuing past per-table failures.
    pub async fn repair_all(&self, requests: &[PkFixRequest]) -> Result<Vec<PkFixReport>> {
        let mut reports = Vec::with_capacity(requests.len());
        for request in requests {
            let outcome = self.ensure_primary_key(request).await?;
            if let PkFixOutcome::Skipped { reason } = &outcome {
                info!(table = %request.table, %reason, "Primary key repair skipped");
            }
            reports.push(PkFixReport {
                request: request.clone(),
                outcome,
            });
        }
        Ok(reports)
    }
}
