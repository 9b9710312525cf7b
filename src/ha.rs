//! Failure-injection harness.
//!
//! One run kills a worker pod and measures what the cluster does about it:
//!
//! 1. **baseline**: capture the dataset row count, insert tagged marker
//!    rows, snapshot shard placements.
//! 2. **inject**: delete the target worker's pod. Destructive, so it runs
//!    only behind an explicit confirmation flag.
//! 3. **availability**: probe reads through the coordinator during the
//!    outage window and compute the success fraction.
//! 4. **recovery**: wait for the replacement pod to report ready.
//! 5. **integrity**: compare row and marker counts against the baseline.
//!    Any shortfall is data loss and fails the run unconditionally.
//! 6. **reregistration**: after a settle delay, check the worker is active
//!    again; one manual re-add is attempted when it is not.
//!
//! The harness checks for shutdown between phases. An interrupt after
//! injection still runs the rollback, which re-registers the target worker
//! if the outage left it missing from the metadata. The report for an
//! interrupted run keeps every step that completed before the abort.

use crate::config::{ClusterConfig, HaConfig, NodeEndpoint, RuntimeConfig};
use crate::db::CoordinatorClient;
use crate::error::{PilotError, Result};
use crate::poller::{HealthPoller, PollConfig, PollOutcome};
use crate::runtime::{ContainerRuntime, PortForwardTunnel};
use crate::shutdown::ShutdownCoordinator;
use crate::types::{availability, AvailabilityMeasurement, StepResult, TestRun};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{info, warn};

/// Everything a run produced, for reporting.
#[derive(Debug)]
pub struct HaReport {
    pub run: TestRun,
    pub target: NodeEndpoint,
    /// Success fraction over the outage probes.
    pub availability: f64,
    pub measurements: Vec<AvailabilityMeasurement>,
    /// Rows or markers went missing. Always fails the run.
    pub data_loss: bool,
    /// The worker had to be re-added manually after recovery.
    pub remediated: bool,
    /// Set when the run was cut short. The steps completed before the
    /// abort stay in `run`.
    pub fatal: Option<PilotError>,
}

impl HaReport {
    pub fn passed(&self) -> bool {
        self.run.failed() == 0 && !self.data_loss && self.fatal.is_none()
    }
}

/// Baseline captured before injection.
struct Baseline {
    dataset_rows: u64,
    marker_tag: String,
}

/// Drives one failure-injection run against a worker.
pub struct FailureInjector {
    runtime: Arc<dyn ContainerRuntime>,
    db: Arc<dyn CoordinatorClient>,
    cluster: ClusterConfig,
    ha: HaConfig,
    runtime_config: RuntimeConfig,
    shutdown: ShutdownCoordinator,
}

impl FailureInjector {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        db: Arc<dyn CoordinatorClient>,
        cluster: ClusterConfig,
        ha: HaConfig,
        runtime_config: RuntimeConfig,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            runtime,
            db,
            cluster,
            ha,
            runtime_config,
            shutdown,
        }
    }

    /// Run the full harness against `target`.
    ///
    /// `confirmed` must be true before anything destructive happens.
    pub async fn run(&self, target: &NodeEndpoint, confirmed: bool) -> Result<HaReport> {
        if !confirmed {
            return Err(PilotError::ConfirmationRequired(format!(
                "deleting the pod behind '{}'",
                target.service
            )));
        }
        if !self.cluster.workers.contains(target) {
            return Err(PilotError::InvalidState(format!(
                "'{}' is not a configured worker",
                target.address()
            )));
        }

        let tunnel = match self.ha.forward_port {
            Some(local) => Some(PortForwardTunnel::spawn(
                &self.runtime_config,
                &self.cluster.coordinator.service,
                local,
                self.cluster.coordinator.port,
            )?),
            None => None,
        };

        let result = self.run_phases(target).await;

        if let Some(tunnel) = tunnel {
            tunnel.shutdown().await;
        }
        result
    }

    async fn run_phases(&self, target: &NodeEndpoint) -> Result<HaReport> {
        let mut run = TestRun::new();
        let mut report = HaReport {
            run: TestRun::new(),
            target: target.clone(),
            availability: 0.0,
            measurements: Vec::new(),
            data_loss: false,
            remediated: false,
            fatal: None,
        };

        info!(run_id = %run.id, target = %target.address(), "Starting failure-injection run");

        // Phase 1: baseline. Nothing destructive has happened yet, so any
        // failure here aborts the run cleanly.
        let baseline = match self.capture_baseline(&mut run).await {
            Ok(baseline) => baseline,
            Err(e) => {
                run.finalize();
                report.run = run;
                warn!(error = %e, "Baseline capture failed; aborting before injection");
                return Ok(report);
            }
        };

        if let Err(e) = self.check_interrupt(target, false).await {
            return Ok(Self::abort(run, report, e));
        }

        // Phase 2: inject.
        let injected = self.inject(&mut run, target).await;
        if !injected {
            run.finalize();
            report.run = run;
            return Ok(report);
        }

        // From here on an interrupt must roll back.
        if let Err(e) = self.check_interrupt(target, true).await {
            return Ok(Self::abort(run, report, e));
        }

        // Phase 3: availability window.
        report.measurements = self.measure_availability(&mut run).await;
        report.availability = availability(&report.measurements);

        if let Err(e) = self.check_interrupt(target, true).await {
            return Ok(Self::abort(run, report, e));
        }

        // Phase 4: recovery.
        self.await_recovery(&mut run, target).await;

        // Settle before touching the metadata again.
        tokio::select! {
            _ = sleep(self.ha.settle_delay) => {}
            _ = self.shutdown.wait_for_shutdown() => {}
        }
        if let Err(e) = self.check_interrupt(target, true).await {
            return Ok(Self::abort(run, report, e));
        }

        // Phase 5: integrity.
        report.data_loss = self.check_integrity(&mut run, &baseline).await;

        // Phase 6: re-registration.
        report.remediated = self.check_reregistration(&mut run, target).await;

        run.finalize();
        report.run = run;
        info!(
            availability = report.availability,
            data_loss = report.data_loss,
            remediated = report.remediated,
            passed = report.passed(),
            "Failure-injection run finished"
        );
        Ok(report)
    }

    async fn capture_baseline(&self, run: &mut TestRun) -> Result<Baseline> {
        let start = Instant::now();
        let tag = format!("run-{}", run.id.simple());

        let result: Result<Baseline> = async {
            self.db.ping().await?;
            let dataset_rows = self.db.count_rows(&self.ha.dataset_table).await?;
            self.db
                .insert_markers(&self.ha.marker_table, &tag, self.ha.marker_rows)
                .await?;
            let placements = self.db.shard_placements().await?;
            let workers = self.db.active_workers().await?;
            info!(
                dataset_rows,
                markers = self.ha.marker_rows,
                placements = placements.len(),
                workers = workers.len(),
                "Baseline captured"
            );
            Ok(Baseline {
                dataset_rows,
                marker_tag: tag,
            })
        }
        .await;

        match result {
            Ok(baseline) => {
                run.record(StepResult::pass(
                    "ha.baseline",
                    format!(
                        "{} dataset rows, {} markers inserted",
                        baseline.dataset_rows, self.ha.marker_rows
                    ),
                    start.elapsed(),
                ));
                Ok(baseline)
            }
            Err(e) => {
                run.record(StepResult::fail("ha.baseline", e.to_string(), start.elapsed()));
                Err(e)
            }
        }
    }

    /// Delete the target's pod. Returns false when injection did not happen.
    async fn inject(&self, run: &mut TestRun, target: &NodeEndpoint) -> bool {
        let start = Instant::now();
        let pods = match self.runtime.list_running(&target.service).await {
            Ok(pods) => pods,
            Err(e) => {
                run.record(StepResult::fail("ha.inject", e.to_string(), start.elapsed()));
                return false;
            }
        };
        let Some(pod) = pods.first() else {
            run.record(StepResult::fail(
                "ha.inject",
                format!("no running pod for service '{}'", target.service),
                start.elapsed(),
            ));
            return false;
        };

        match self.runtime.delete_pod(pod).await {
            Ok(()) => {
                info!(%pod, "Injected failure: pod deleted");
                run.record(StepResult::pass(
                    "ha.inject",
                    format!("deleted pod '{}'", pod),
                    start.elapsed(),
                ));
                true
            }
            Err(e) => {
                run.record(StepResult::fail("ha.inject", e.to_string(), start.elapsed()));
                false
            }
        }
    }

    async fn measure_availability(&self, run: &mut TestRun) -> Vec<AvailabilityMeasurement> {
        let start = Instant::now();
        let mut measurements = Vec::with_capacity(self.ha.outage_probes as usize);

        for i in 1..=self.ha.outage_probes {
            if self.shutdown.is_shutting_down() {
                break;
            }
            let probe_start = Instant::now();
            let ok = self.db.count_rows(&self.ha.dataset_table).await.is_ok();
            measurements.push(AvailabilityMeasurement::new(i, ok, probe_start.elapsed()));

            if i < self.ha.outage_probes {
                tokio::select! {
                    _ = sleep(self.ha.probe_interval) => {}
                    _ = self.shutdown.wait_for_shutdown() => {}
                }
            }
        }

        let fraction = availability(&measurements);
        let detail = format!(
            "{}/{} probes succeeded ({:.0}% vs {:.0}% required)",
            measurements.iter().filter(|m| m.success).count(),
            measurements.len(),
            fraction * 100.0,
            self.ha.min_availability * 100.0
        );
        if fraction >= self.ha.min_availability {
            run.record(StepResult::pass("ha.availability", detail, start.elapsed()));
        } else {
            run.record(StepResult::fail("ha.availability", detail, start.elapsed()));
        }
        measurements
    }

    async fn await_recovery(&self, run: &mut TestRun, target: &NodeEndpoint) {
        let start = Instant::now();
        let poller = HealthPoller::new(PollConfig::deadline(
            self.ha.recovery_timeout,
            self.ha.recovery_poll_interval,
        ));

        let runtime = &self.runtime;
        let service = target.service.as_str();
        let outcome = poller
            .poll(move || async move {
                if runtime.is_ready(service).await? {
                    Ok(())
                } else {
                    Err(PilotError::NotReady(format!(
                        "pod for '{}' not ready yet",
                        service
                    )))
                }
            })
            .await;

        match outcome {
            PollOutcome::Success { attempts, .. } => {
                run.record(StepResult::pass(
                    "ha.recovery",
                    format!("pod ready again after {} checks", attempts),
                    start.elapsed(),
                ));
            }
            PollOutcome::TimedOut { elapsed, .. } => {
                run.record(StepResult::fail(
                    "ha.recovery",
                    format!("pod not ready after {:?}", elapsed),
                    start.elapsed(),
                ));
            }
            PollOutcome::Aborted { error, .. } => {
                run.record(StepResult::fail("ha.recovery", error.to_string(), start.elapsed()));
            }
        }
    }

    /// Returns true when data went missing.
    async fn check_integrity(&self, run: &mut TestRun, baseline: &Baseline) -> bool {
        let start = Instant::now();
        let counts: Result<(u64, u64)> = async {
            let rows = self.db.count_rows(&self.ha.dataset_table).await?;
            let markers = self
                .db
                .count_markers(&self.ha.marker_table, &baseline.marker_tag)
                .await?;
            Ok((rows, markers))
        }
        .await;

        match counts {
            Ok((rows, markers))
                if rows >= baseline.dataset_rows && markers == u64::from(self.ha.marker_rows) =>
            {
                run.record(StepResult::pass(
                    "ha.integrity",
                    format!("{} dataset rows, {} markers intact", rows, markers),
                    start.elapsed(),
                ));
                false
            }
            Ok((rows, markers)) => {
                warn!(
                    rows,
                    expected_rows = baseline.dataset_rows,
                    markers,
                    expected_markers = self.ha.marker_rows,
                    "Data loss detected"
                );
                run.record(StepResult::fail(
                    "ha.integrity",
                    format!(
                        "dataset {}/{} rows, markers {}/{}",
                        rows, baseline.dataset_rows, markers, self.ha.marker_rows
                    ),
                    start.elapsed(),
                ));
                true
            }
            Err(e) => {
                run.record(StepResult::fail("ha.integrity", e.to_string(), start.elapsed()));
                true
            }
        }
    }

    /// Returns true when the worker had to be re-added manually.
    async fn check_reregistration(&self, run: &mut TestRun, target: &NodeEndpoint) -> bool {
        let start = Instant::now();

        match self.is_registered(target).await {
            Ok(true) => {
                run.record(StepResult::pass(
                    "ha.reregistration",
                    "worker active without intervention",
                    start.elapsed(),
                ));
                return false;
            }
            Err(e) => {
                run.record(StepResult::fail("ha.reregistration", e.to_string(), start.elapsed()));
                return false;
            }
            Ok(false) => {}
        }

        // One manual remediation attempt.
        let remediation: Result<bool> = async {
            self.db.add_worker(&target.host, target.port).await?;
            self.is_registered(target).await
        }
        .await;

        match remediation {
            Ok(true) => {
                warn!(worker = %target.address(), "Worker required manual re-registration");
                run.record(StepResult::pass(
                    "ha.reregistration",
                    "worker re-added manually after recovery",
                    start.elapsed(),
                ));
                true
            }
            Ok(false) => {
                run.record(StepResult::fail(
                    "ha.reregistration",
                    "worker still missing after manual re-add",
                    start.elapsed(),
                ));
                false
            }
            Err(e) => {
                run.record(StepResult::fail("ha.reregistration", e.to_string(), start.elapsed()));
                false
            }
        }
    }

    async fn is_registered(&self, target: &NodeEndpoint) -> Result<bool> {
        let workers = self.db.active_workers().await?;
        Ok(workers
            .iter()
            .any(|(h, p)| *h == target.host && *p == target.port))
    }

    /// Close out an interrupted run without losing the steps that already
    /// ran. The abort itself lands as a final failed step.
    fn abort(mut run: TestRun, mut report: HaReport, e: PilotError) -> HaReport {
        run.record(StepResult::fail("ha.abort", e.to_string(), Duration::ZERO));
        run.finalize();
        report.run = run;
        report.fatal = Some(e);
        report
    }

    /// Abort on shutdown. With `rollback`, first try to put the metadata
    /// back the way injection found it.
    async fn check_interrupt(&self, target: &NodeEndpoint, rollback: bool) -> Result<()> {
        if !self.shutdown.is_shutting_down() {
            return Ok(());
        }
        if rollback {
            warn!(target = %target.address(), "Interrupted mid-run; rolling back");
            match self.is_registered(target).await {
                Ok(true) => info!("Target worker still registered; nothing to roll back"),
                Ok(false) => {
                    if let Err(e) = self.db.add_worker(&target.host, target.port).await {
                        warn!(error = %e, "Rollback re-registration failed");
                    } else {
                        info!(worker = %target.address(), "Rollback re-registered worker");
                    }
                }
                Err(e) => warn!(error = %e, "Rollback could not read worker metadata"),
            }
        }
        Err(PilotError::Interrupted)
    }
}
