//! shardpilot CLI - Main entry point.

use clap::Parser;
use shardpilot::cli::{Cli, Commands};
use shardpilot::config::{NodeEndpoint, PilotConfig};
use shardpilot::configure::ClusterConfigurator;
use shardpilot::db::{CoordinatorClient, PsqlClient};
use shardpilot::error::PilotError;
use shardpilot::ha::FailureInjector;
use shardpilot::prereq::PrerequisiteChecker;
use shardpilot::rebalance::RebalanceDrainOrchestrator;
use shardpilot::report::ReportGenerator;
use shardpilot::runtime::{ContainerRuntime, KubectlRuntime};
use shardpilot::shutdown::{ShutdownCoordinator, SignalHandler};
use shardpilot::types::{StepResult, TestRun};
use shardpilot::verify::ClusterVerifier;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

/// Exit code for a run with failed steps.
const EXIT_STEP_FAILURE: i32 = 1;
/// Exit code for a fatal abort.
const EXIT_FATAL: i32 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PilotConfig::from_file(path)?,
        None => PilotConfig::development(),
    };
    config.observability.log_level = cli.log_level.clone();
    config.observability.json_logs = cli.json_logs;
    shardpilot::observability::init(&config.observability)?;

    let shutdown = ShutdownCoordinator::new();
    tokio::spawn(SignalHandler::new(shutdown.clone()).run());

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(KubectlRuntime::new(config.runtime.clone()));
    let db: Arc<dyn CoordinatorClient> = Arc::new(PsqlClient::new(
        Arc::clone(&runtime),
        config.cluster.coordinator.service.clone(),
        config.cluster.database.clone(),
    ));
    let reports = ReportGenerator::new(config.report.clone());

    let code = match cli.command {
        Commands::Bootstrap => bootstrap(&config, &runtime, &db, &reports).await?,
        Commands::Verify => verify(&config, &db, &reports).await?,
        Commands::Rebalance => rebalance(&config, &db, &reports).await?,
        Commands::Drain { node } => drain(&config, &db, &reports, &node).await?,
        Commands::HaTest { target, yes } => {
            ha_test(&config, &runtime, &db, &reports, shutdown, target, yes).await?
        }
        Commands::Version => {
            println!("shardpilot {}", shardpilot::VERSION);
            0
        }
    };

    std::process::exit(code);
}

/// Write the artifact and render the table, then decide the exit code.
fn finish(
    reports: &ReportGenerator,
    command: &str,
    mut run: TestRun,
    fatal: Option<PilotError>,
) -> anyhow::Result<i32> {
    run.finalize();
    let report = reports.generate(command, &run);
    let path = reports.write(&report)?;
    println!("{}", reports.render_table(&report));
    println!("Report: {}", path.display());

    if let Some(e) = fatal {
        error!(error = %e, "Run aborted");
        return Ok(EXIT_FATAL);
    }
    Ok(if run.failed() == 0 { 0 } else { EXIT_STEP_FAILURE })
}

async fn bootstrap(
    config: &PilotConfig,
    runtime: &Arc<dyn ContainerRuntime>,
    db: &Arc<dyn CoordinatorClient>,
    reports: &ReportGenerator,
) -> anyhow::Result<i32> {
    let mut run = TestRun::new();

    let checker = PrerequisiteChecker::new(
        Arc::clone(runtime),
        Arc::clone(db),
        config.cluster.clone(),
    );
    let start = Instant::now();
    if let Err(e) = checker.ensure().await {
        run.record(StepResult::fail("bootstrap.prereq", e.to_string(), start.elapsed()));
        return finish(reports, "bootstrap", run, Some(e));
    }
    run.record(StepResult::pass(
        "bootstrap.prereq",
        "all prerequisites satisfied",
        start.elapsed(),
    ));

    let configurator =
        ClusterConfigurator::new(Arc::clone(db), config.cluster.clone(), config.retry.clone());

    let start = Instant::now();
    match configurator.ensure_coordinator_host().await {
        Ok(()) => run.record(StepResult::pass(
            "bootstrap.coordinator",
            format!("coordinator host is {}", config.cluster.coordinator.address()),
            start.elapsed(),
        )),
        Err(e) if e.is_fatal() => {
            run.record(StepResult::fail("bootstrap.coordinator", e.to_string(), start.elapsed()));
            return finish(reports, "bootstrap", run, Some(e));
        }
        Err(e) => {
            run.record(StepResult::fail("bootstrap.coordinator", e.to_string(), start.elapsed()));
            // Workers cannot register against a misconfigured coordinator.
            return finish(reports, "bootstrap", run, None);
        }
    }

    let start = Instant::now();
    let all_registered = match configurator.register_workers().await {
        Ok(registration) => {
            for worker in &registration.registered {
                let attempts = registration
                    .attempts
                    .iter()
                    .filter(|a| a.node == worker.address())
                    .count();
                run.record(StepResult::pass(
                    format!("bootstrap.register.{}", worker.host),
                    format!("registered after {} attempts", attempts.max(1)),
                    start.elapsed(),
                ));
            }
            for (worker, e) in &registration.failed {
                run.record(StepResult::fail(
                    format!("bootstrap.register.{}", worker.host),
                    e.to_string(),
                    start.elapsed(),
                ));
            }
            registration.all_registered()
        }
        Err(e) => {
            run.record(StepResult::fail("bootstrap.register", e.to_string(), start.elapsed()));
            return finish(reports, "bootstrap", run, Some(e));
        }
    };

    // Spread placements across the freshly registered worker set, then run
    // the read-only verification suite over the result.
    if all_registered {
        let mut orchestrator =
            RebalanceDrainOrchestrator::new(Arc::clone(db), config.repair.clone());
        let start = Instant::now();
        match orchestrator.rebalance().await {
            Ok(placements) => {
                let total: u64 = placements.iter().map(|p| p.shard_count).sum();
                run.record(StepResult::pass(
                    "bootstrap.rebalance",
                    format!("{} placements across {} nodes", total, placements.len()),
                    start.elapsed(),
                ));
            }
            Err(e) if e.is_fatal() => {
                run.record(StepResult::fail("bootstrap.rebalance", e.to_string(), start.elapsed()));
                return finish(reports, "bootstrap", run, Some(e));
            }
            Err(e) => {
                run.record(StepResult::fail("bootstrap.rebalance", e.to_string(), start.elapsed()));
            }
        }
    } else {
        run.record(StepResult::skipped(
            "bootstrap.rebalance",
            "not all workers registered",
        ));
    }

    let verifier = ClusterVerifier::new(Arc::clone(db), config.cluster.clone());
    match verifier.verify().await {
        Ok(verification) => {
            for check in verification.checks {
                run.record(check);
            }
        }
        Err(e) => {
            run.record(StepResult::fail("verify", e.to_string(), std::time::Duration::ZERO));
        }
    }

    finish(reports, "bootstrap", run, None)
}

async fn verify(
    config: &PilotConfig,
    db: &Arc<dyn CoordinatorClient>,
    reports: &ReportGenerator,
) -> anyhow::Result<i32> {
    let mut run = TestRun::new();
    let verifier = ClusterVerifier::new(Arc::clone(db), config.cluster.clone());

    match verifier.verify().await {
        Ok(verification) => {
            for check in verification.checks {
                run.record(check);
            }
            finish(reports, "verify", run, None)
        }
        Err(e) => {
            run.record(StepResult::fail("verify", e.to_string(), std::time::Duration::ZERO));
            finish(reports, "verify", run, Some(e))
        }
    }
}

async fn rebalance(
    config: &PilotConfig,
    db: &Arc<dyn CoordinatorClient>,
    reports: &ReportGenerator,
) -> anyhow::Result<i32> {
    let mut run = TestRun::new();
    let mut orchestrator = RebalanceDrainOrchestrator::new(Arc::clone(db), config.repair.clone());

    let start = Instant::now();
    match orchestrator.rebalance().await {
        Ok(placements) => {
            let total: u64 = placements.iter().map(|p| p.shard_count).sum();
            run.record(StepResult::pass(
                "rebalance.execute",
                format!("{} placements across {} nodes", total, placements.len()),
                start.elapsed(),
            ));
            finish(reports, "rebalance", run, None)
        }
        Err(e) if e.is_fatal() => {
            run.record(StepResult::fail("rebalance.execute", e.to_string(), start.elapsed()));
            finish(reports, "rebalance", run, Some(e))
        }
        Err(e) => {
            run.record(StepResult::fail("rebalance.execute", e.to_string(), start.elapsed()));
            finish(reports, "rebalance", run, None)
        }
    }
}

async fn drain(
    config: &PilotConfig,
    db: &Arc<dyn CoordinatorClient>,
    reports: &ReportGenerator,
    node: &str,
) -> anyhow::Result<i32> {
    let mut run = TestRun::new();

    let Some(target) = find_worker(config, Some(node)) else {
        run.record(StepResult::fail(
            "drain.target",
            format!("'{}' is not a configured worker", node),
            std::time::Duration::ZERO,
        ));
        return finish(reports, "drain", run, None);
    };

    let mut orchestrator = RebalanceDrainOrchestrator::new(Arc::clone(db), config.repair.clone());

    let start = Instant::now();
    match orchestrator.drain(&target).await {
        Ok(drain_report) => {
            for repair in &drain_report.repairs {
                run.record(StepResult::pass(
                    format!("drain.repair.{}", repair.request.table),
                    format!("{:?}", repair.outcome),
                    std::time::Duration::ZERO,
                ));
            }
            run.record(StepResult::pass(
                "drain.execute",
                format!("{} drained, {} nodes still hold placements",
                    target.address(),
                    drain_report.placements.iter().filter(|p| p.shard_count > 0).count()),
                start.elapsed(),
            ));
            finish(reports, "drain", run, None)
        }
        Err(e) if e.is_fatal() => {
            run.record(StepResult::fail("drain.execute", e.to_string(), start.elapsed()));
            finish(reports, "drain", run, Some(e))
        }
        Err(e) => {
            run.record(StepResult::fail("drain.execute", e.to_string(), start.elapsed()));
            finish(reports, "drain", run, None)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn ha_test(
    config: &PilotConfig,
    runtime: &Arc<dyn ContainerRuntime>,
    db: &Arc<dyn CoordinatorClient>,
    reports: &ReportGenerator,
    shutdown: ShutdownCoordinator,
    target: Option<String>,
    yes: bool,
) -> anyhow::Result<i32> {
    let Some(target) = find_worker(config, target.as_deref()) else {
        error!("No matching worker configured");
        return Ok(EXIT_FATAL);
    };

    let injector = FailureInjector::new(
        Arc::clone(runtime),
        Arc::clone(db),
        config.cluster.clone(),
        config.ha.clone(),
        config.runtime.clone(),
        shutdown,
    );

    match injector.run(&target, yes).await {
        Ok(ha_report) => {
            let report = reports.generate_ha(&ha_report, config.ha.min_availability);
            let path = reports.write(&report)?;
            println!("{}", reports.render_table(&report));
            println!("Report: {}", path.display());
            if let Some(e) = &ha_report.fatal {
                error!(error = %e, "Run aborted");
                return Ok(EXIT_FATAL);
            }
            Ok(if ha_report.passed() { 0 } else { EXIT_STEP_FAILURE })
        }
        Err(e) => {
            // Aborted runs still leave an artifact naming the reason.
            let mut run = TestRun::new();
            run.record(StepResult::fail(
                "ha.abort",
                e.to_string(),
                std::time::Duration::ZERO,
            ));
            finish(reports, "ha-test", run, Some(e))
        }
    }
}

/// Resolve a worker by host, or the first configured worker when unset.
fn find_worker(config: &PilotConfig, host: Option<&str>) -> Option<NodeEndpoint> {
    match host {
        Some(host) => config
            .cluster
            .workers
            .iter()
            .find(|w| w.host == host)
            .cloned(),
        None => config.cluster.workers.first().cloned(),
    }
}
