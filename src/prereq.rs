//! Environment prerequisite checks.
//!
//! Runs before any stateful action. Every check is evaluated even after an
//! earlier one fails so the operator sees the full list of missing pieces,
//! then [`PrerequisiteChecker::ensure`] turns any failure into a fatal error.

use crate::config::ClusterConfig;
use crate::db::CoordinatorClient;
use crate::error::{PilotError, Result};
use crate::runtime::ContainerRuntime;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One prerequisite that did not hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingPrerequisite {
    /// Short check name, e.g. `runtime.reachable`.
    pub check: String,
    pub detail: String,
}

impl MissingPrerequisite {
    fn new(check: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            check: check.into(),
            detail: detail.into(),
        }
    }
}

/// Verifies the control plane, pods, and database extension before a run.
pub struct PrerequisiteChecker {
    runtime: Arc<dyn ContainerRuntime>,
    db: Arc<dyn CoordinatorClient>,
    cluster: ClusterConfig,
}

impl PrerequisiteChecker {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        db: Arc<dyn CoordinatorClient>,
        cluster: ClusterConfig,
    ) -> Self {
        Self {
            runtime,
            db,
            cluster,
        }
    }

    /// Run all checks and collect every failure.
    pub async fn check_all(&self) -> Vec<MissingPrerequisite> {
        let mut missing = Vec::new();

        match self.runtime.version().await {
            Ok(version) => debug!(%version, "Control plane reachable"),
            Err(e) => {
                missing.push(MissingPrerequisite::new(
                    "runtime.reachable",
                    format!("Control plane is not reachable: {}", e),
                ));
            }
        }

        let mut services = vec![&self.cluster.coordinator];
        services.extend(self.cluster.workers.iter());
        for endpoint in services {
            match self.runtime.list_running(&endpoint.service).await {
                Ok(pods) if pods.is_empty() => {
                    missing.push(MissingPrerequisite::new(
                        format!("pods.{}", endpoint.service),
                        format!("No running pod for service '{}'", endpoint.service),
                    ));
                }
                Ok(pods) => debug!(service = %endpoint.service, pods = pods.len(), "Pods running"),
                Err(e) => {
                    missing.push(MissingPrerequisite::new(
                        format!("pods.{}", endpoint.service),
                        format!("Failed to list pods for '{}': {}", endpoint.service, e),
                    ));
                }
            }
        }

        match self.db.extension_version(&self.cluster.extension).await {
            Ok(Some(version)) => {
                debug!(extension = %self.cluster.extension, %version, "Extension installed");
            }
            Ok(None) => {
                missing.push(MissingPrerequisite::new(
                    "db.extension",
                    format!(
                        "Extension '{}' is not installed on the coordinator",
                        self.cluster.extension
                    ),
                ));
            }
            Err(e) => {
                missing.push(MissingPrerequisite::new(
                    "db.extension",
                    format!("Failed to query extension catalog: {}", e),
                ));
            }
        }

        missing
    }

    /// Fail fatally unless every prerequisite holds.
    pub async fn ensure(&self) -> Result<()> {
        let missing = self.check_all().await;
        if missing.is_empty() {
            info!("All prerequisites satisfied");
            return Ok(());
        }

        for m in &missing {
            warn!(check = %m.check, detail = %m.detail, "Prerequisite not satisfied");
        }
        let summary = missing
            .iter()
            .map(|m| format!("{} ({})", m.check, m.detail))
            .collect::<Vec<_>>()
            .join("; ");
        Err(PilotError::PrerequisiteMissing(summary))
    }
}
