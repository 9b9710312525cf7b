//! Coordinator and worker registration.
//!
//! Bootstrapping is idempotent: the coordinator host is only written when it
//! differs from the desired value, and a worker already present in the active
//! set is not re-added. Each worker is registered independently, so one
//! unreachable worker never blocks the others.

use crate::config::{ClusterConfig, NodeEndpoint, RetryConfig};
use crate::db::CoordinatorClient;
use crate::error::{PilotError, Result};
use crate::poller::{HealthPoller, PollConfig, PollOutcome};
use crate::types::{AttemptOutcome, RegistrationAttempt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Result of registering the full worker set.
#[derive(Debug)]
pub struct RegistrationReport {
    /// Workers confirmed active (pre-existing or newly added).
    pub registered: Vec<NodeEndpoint>,
    /// Workers that could not be registered, with the final error.
    pub failed: Vec<(NodeEndpoint, PilotError)>,
    /// Every attempt made, in order, across all workers.
    pub attempts: Vec<RegistrationAttempt>,
}

impl RegistrationReport {
    pub fn all_registered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Brings the cluster metadata to the configured topology.
pub struct ClusterConfigurator {
    db: Arc<dyn CoordinatorClient>,
    cluster: ClusterConfig,
    retry: RetryConfig,
}

impl ClusterConfigurator {
    pub fn new(db: Arc<dyn CoordinatorClient>, cluster: ClusterConfig, retry: RetryConfig) -> Self {
        Self { db, cluster, retry }
    }

    /// Ensure the metadata points at the coordinator's own address.
    ///
    /// Reads the current value first and skips the write when it already
    /// matches. Retries transient failures up to the configured attempt
    /// count; the coordinator is typically still initializing when this
    /// runs.
    pub async fn ensure_coordinator_host(&self) -> Result<()> {
        let desired = &self.cluster.coordinator;
        let db = &self.db;
        let poller = HealthPoller::new(PollConfig::attempts(
            self.retry.coordinator_attempts,
            self.retry.coordinator_backoff,
        ));

        let outcome = poller
            .poll(move || async move {
                let current = db.coordinator_host().await?;
                match current {
                    Some((host, port)) if host == desired.host && port == desired.port => {
                        info!(host = %desired.host, port = desired.port,
                            "Coordinator host already set");
                        Ok(false)
                    }
                    current => {
                        if let Some((host, port)) = current {
                            info!(from = %format!("{}:{}", host, port),
                                to = %desired.address(), "Updating coordinator host");
                        }
                        db.set_coordinator_host(&desired.host, desired.port).await?;
                        Ok(true)
                    }
                }
            })
            .await;

        match outcome {
            PollOutcome::Success { value: wrote, attempts, .. } => {
                info!(host = %desired.host, port = desired.port, attempts, wrote,
                    "Coordinator host configured");
                Ok(())
            }
            other => other.into_result().map(|_| ()),
        }
    }

    /// Register one worker, logging every attempt.
    ///
    /// Returns `Ok` if the worker is active on the coordinator afterwards
    /// (whether or not this call added it). Permanent failures stop the
    /// retry loop on the spot.
    pub async fn register_worker(
        &self,
        worker: &NodeEndpoint,
        attempts: &Mutex<Vec<RegistrationAttempt>>,
    ) -> Result<()> {
        let active = self.db.active_workers().await?;
        if active.iter().any(|(h, p)| *h == worker.host && *p == worker.port) {
            info!(worker = %worker.address(), "Worker already registered");
            record(
                attempts,
                RegistrationAttempt::new(worker.address(), 1, AttemptOutcome::Success)
                    .with_detail("already registered"),
            );
            return Ok(());
        }

        let poller = HealthPoller::new(PollConfig::attempts(
            self.retry.register_attempts,
            self.retry.register_backoff,
        ));

        let counter = AtomicU32::new(0);
        let counter_ref = &counter;
        let db = &self.db;
        let outcome = poller
            .poll(move || async move {
                let n = counter_ref.fetch_add(1, Ordering::SeqCst) + 1;
                match db.add_worker(&worker.host, worker.port).await {
                    Ok(()) => {
                        record(attempts, RegistrationAttempt::new(
                            worker.address(),
                            n,
                            AttemptOutcome::Success,
                        ));
                        Ok(())
                    }
                    Err(e) => {
                        let outcome = if e.is_transient() {
                            AttemptOutcome::TransientFailure
                        } else {
                            AttemptOutcome::PermanentFailure
                        };
                        record(attempts, RegistrationAttempt::new(worker.address(), n, outcome)
                            .with_detail(e.to_string()));
                        Err(e)
                    }
                }
            })
            .await;

        match outcome {
            PollOutcome::Success { attempts: n, .. } => {
                info!(worker = %worker.address(), attempts = n, "Worker registered");
                Ok(())
            }
            other => {
                let err = match other.into_result() {
                    Err(e) => e,
                    Ok(()) => PilotError::Internal("poll reported success twice".into()),
                };
                warn!(worker = %worker.address(), error = %err, "Worker registration failed");
                Err(err)
            }
        }
    }

    /// Register every configured worker, independently.
    pub async fn register_workers(&self) -> Result<RegistrationReport> {
        let attempts = Mutex::new(Vec::new());
        let mut registered = Vec::new();
        let mut failed = Vec::new();

        for worker in &self.cluster.workers {
            match self.register_worker(worker, &attempts).await {
                Ok(()) => registered.push(worker.clone()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => failed.push((worker.clone(), e)),
            }
        }

        let attempts = attempts
            .into_inner()
            .map_err(|_| PilotError::Internal("attempt log poisoned".into()))?;
        Ok(RegistrationReport {
            registered,
            failed,
            attempts,
        })
    }

    /// Number of workers the coordinator currently reports active.
    pub async fn active_worker_count(&self) -> Result<usize> {
        Ok(self.db.active_workers().await?.len())
    }
}

fn record(attempts: &Mutex<Vec<RegistrationAttempt>>, attempt: RegistrationAttempt) {
    if let Ok(mut guard) = attempts.lock() {
        guard.push(attempt);
    }
}
