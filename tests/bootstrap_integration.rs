//! Integration tests for bootstrap, repair, rebalance, drain, and verify.

mod common;

use common::{fast_config, FakeDb, FakeRuntime, FakeTable};
use shardpilot::configure::ClusterConfigurator;
use shardpilot::db::CoordinatorClient;
use shardpilot::error::PilotError;
use shardpilot::prereq::PrerequisiteChecker;
use shardpilot::rebalance::{MovePhase, RebalanceDrainOrchestrator};
use shardpilot::repair::SchemaRepairer;
use shardpilot::types::{AttemptOutcome, PkFixOutcome, PkFixRequest, RegistrationAttempt, StepStatus};
use shardpilot::verify::ClusterVerifier;
use std::sync::{Arc, Mutex};

fn configurator(db: &Arc<FakeDb>) -> ClusterConfigurator {
    let config = fast_config();
    ClusterConfigurator::new(
        db.clone() as Arc<dyn CoordinatorClient>,
        config.cluster,
        config.retry,
    )
}

#[tokio::test]
async fn cold_bootstrap_configures_coordinator_and_workers() {
    let db = Arc::new(FakeDb::empty());
    let configurator = configurator(&db);

    configurator.ensure_coordinator_host().await.unwrap();
    let report = configurator.register_workers().await.unwrap();

    assert!(report.all_registered());
    assert_eq!(report.registered.len(), 2);

    let st = db.state.lock().unwrap();
    assert_eq!(st.coordinator, Some(("coordinator".to_string(), 5432)));
    assert_eq!(st.workers.len(), 2);
}

#[tokio::test]
async fn bootstrap_is_idempotent() {
    let db = Arc::new(FakeDb::bootstrapped());
    let configurator = configurator(&db);

    configurator.ensure_coordinator_host().await.unwrap();
    let report = configurator.register_workers().await.unwrap();

    assert!(report.all_registered());
    // Everything was already in place; each worker logs one no-op success.
    assert_eq!(report.attempts.len(), 2);
    for attempt in &report.attempts {
        assert_eq!(attempt.outcome, AttemptOutcome::Success);
        assert_eq!(attempt.detail.as_deref(), Some("already registered"));
    }
    assert_eq!(db.state.lock().unwrap().workers.len(), 2);
}

#[tokio::test]
async fn registration_retries_transient_failures() {
    let db = Arc::new(FakeDb::empty().with_state(|st| {
        st.add_worker_errors
            .push_back(PilotError::ConnectionRefused("worker starting".into()));
        st.add_worker_errors
            .push_back(PilotError::NotReady("still initializing".into()));
    }));
    let configurator = configurator(&db);

    let attempts = Mutex::new(Vec::<RegistrationAttempt>::new());
    let worker = fast_config().cluster.workers[0].clone();
    configurator.register_worker(&worker, &attempts).await.unwrap();

    let attempts = attempts.into_inner().unwrap();
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[0].outcome, AttemptOutcome::TransientFailure);
    assert_eq!(attempts[1].outcome, AttemptOutcome::TransientFailure);
    assert_eq!(attempts[2].outcome, AttemptOutcome::Success);
    assert_eq!(attempts[2].attempt_number, 3);
}

#[tokio::test]
async fn registration_gives_up_after_attempt_budget() {
    let db = Arc::new(FakeDb::empty().with_state(|st| {
        for _ in 0..10 {
            st.add_worker_errors
                .push_back(PilotError::ConnectionRefused("down".into()));
        }
    }));
    let configurator = configurator(&db);

    let attempts = Mutex::new(Vec::new());
    let worker = fast_config().cluster.workers[0].clone();
    let result = configurator.register_worker(&worker, &attempts).await;

    assert!(result.is_err());
    // Exactly the configured attempt budget, never more.
    assert_eq!(attempts.into_inner().unwrap().len(), 5);
}

#[tokio::test]
async fn permanent_failure_stops_retrying_immediately() {
    let db = Arc::new(FakeDb::empty().with_state(|st| {
        st.add_worker_errors
            .push_back(PilotError::InvalidHostname("worker-0".into()));
    }));
    let configurator = configurator(&db);

    let report = configurator.register_workers().await.unwrap();

    // worker-0 failed on its single attempt, worker-1 registered anyway.
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0.host, "worker-0");
    assert_eq!(report.registered.len(), 1);
    assert_eq!(report.registered[0].host, "worker-1");

    let worker0_attempts = report
        .attempts
        .iter()
        .filter(|a| a.node == "worker-0:5432")
        .count();
    assert_eq!(worker0_attempts, 1);
}

#[tokio::test]
async fn prerequisite_failures_are_collected_not_short_circuited() {
    let runtime = Arc::new(FakeRuntime::healthy().with_state(|st| {
        st.pods.remove("db-worker-1");
    }));
    let db = Arc::new(FakeDb::empty().with_state(|st| {
        st.extension = None;
    }));

    let checker = PrerequisiteChecker::new(
        runtime,
        db,
        fast_config().cluster,
    );

    let missing = checker.check_all().await;
    let checks: Vec<&str> = missing.iter().map(|m| m.check.as_str()).collect();
    assert!(checks.contains(&"pods.db-worker-1"));
    assert!(checks.contains(&"db.extension"));
    assert_eq!(missing.len(), 2);

    let err = checker.ensure().await.unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn pk_repair_ladder_skips_and_adds() {
    let db = Arc::new(FakeDb::empty().with_state(|st| {
        st.tables.insert(
            "orders".to_string(),
            FakeTable::new(&["id", "total"], false, 10, true),
        );
        st.tables.insert(
            "customers".to_string(),
            FakeTable::new(&["id"], true, 5, true),
        );
    }));
    let repairer = SchemaRepairer::new(db.clone());

    // Missing table.
    let outcome = repairer
        .ensure_primary_key(&PkFixRequest::new("ghosts", "id"))
        .await
        .unwrap();
    assert!(matches!(outcome, PkFixOutcome::Skipped { .. }));

    // Key already present.
    let outcome = repairer
        .ensure_primary_key(&PkFixRequest::new("customers", "id"))
        .await
        .unwrap();
    assert!(matches!(outcome, PkFixOutcome::Skipped { .. }));

    // Candidate column missing.
    let outcome = repairer
        .ensure_primary_key(&PkFixRequest::new("orders", "uuid"))
        .await
        .unwrap();
    assert!(matches!(outcome, PkFixOutcome::Skipped { .. }));

    // Addable.
    let outcome = repairer
        .ensure_primary_key(&PkFixRequest::new("orders", "id"))
        .await
        .unwrap();
    assert_eq!(outcome, PkFixOutcome::Added);
    assert!(db.has_primary_key("orders").await.unwrap());
}

#[tokio::test]
async fn drain_is_blocked_by_tables_without_primary_key() {
    let db = Arc::new(FakeDb::bootstrapped().with_state(|st| {
        st.tables.insert(
            "events".to_string(),
            FakeTable::new(&["ts", "payload"], false, 50, true),
        );
    }));
    let config = fast_config();
    let mut orchestrator =
        RebalanceDrainOrchestrator::new(db.clone(), config.repair.clone());

    let err = orchestrator
        .drain(&config.cluster.workers[0])
        .await
        .unwrap_err();

    match err {
        PilotError::DrainBlocked { tables } => assert_eq!(tables, vec!["events".to_string()]),
        other => panic!("expected DrainBlocked, got {:?}", other),
    }
    // A blocked drain leaves the orchestrator usable.
    assert_eq!(orchestrator.phase(), MovePhase::Idle);
    // No placements moved.
    let st = db.state.lock().unwrap();
    assert_eq!(st.placements[0], ("worker-0".to_string(), 16));
}

#[tokio::test]
async fn drain_repairs_allow_listed_table_then_moves_placements() {
    let db = Arc::new(FakeDb::bootstrapped().with_state(|st| {
        // "orders" lacks a key but is on the allow-list in the dev config.
        st.tables.insert(
            "orders".to_string(),
            FakeTable::new(&["id", "total"], false, 10, true),
        );
    }));
    let config = fast_config();
    let mut orchestrator =
        RebalanceDrainOrchestrator::new(db.clone(), config.repair.clone());

    let report = orchestrator.drain(&config.cluster.workers[0]).await.unwrap();

    assert_eq!(orchestrator.phase(), MovePhase::Done);
    assert_eq!(report.repairs.len(), 1);
    assert_eq!(report.repairs[0].outcome, PkFixOutcome::Added);
    let drained = report
        .placements
        .iter()
        .find(|p| p.node == "worker-0")
        .unwrap();
    assert_eq!(drained.shard_count, 0);
}

#[tokio::test]
async fn failed_rebalance_returns_to_idle() {
    let db = Arc::new(FakeDb::bootstrapped().with_state(|st| {
        st.workers.clear();
    }));
    let mut orchestrator =
        RebalanceDrainOrchestrator::new(db.clone(), fast_config().repair);

    let err = orchestrator.rebalance().await.unwrap_err();
    assert!(matches!(err, PilotError::RebalanceFailed(_)));
    assert_eq!(orchestrator.phase(), MovePhase::Idle);
}

#[tokio::test]
async fn verify_passes_on_healthy_cluster() {
    let db = Arc::new(FakeDb::bootstrapped());
    let verifier = ClusterVerifier::new(db, fast_config().cluster);

    let report = verifier.verify().await.unwrap();
    assert!(report.all_passed(), "failed checks: {:?}", report.failed());
    assert_eq!(report.checks.len(), 5);
}

#[tokio::test]
async fn verify_fails_when_sharding_extension_is_missing() {
    let db = Arc::new(FakeDb::bootstrapped().with_state(|st| st.extension = None));
    let verifier = ClusterVerifier::new(db, fast_config().cluster);

    let report = verifier.verify().await.unwrap();
    assert!(!report.all_passed());

    let failing: Vec<&str> = report.failed().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(failing, vec!["verify.extension"]);
}

#[tokio::test]
async fn verify_flags_missing_workers_and_lopsided_placements() {
    let db = Arc::new(FakeDb::bootstrapped().with_state(|st| {
        st.workers.truncate(1);
        st.placements = vec![("worker-0".to_string(), 32)];
    }));
    let verifier = ClusterVerifier::new(db, fast_config().cluster);

    let report = verifier.verify().await.unwrap();
    assert!(!report.all_passed());

    let failing: Vec<&str> = report.failed().iter().map(|c| c.name.as_str()).collect();
    assert!(failing.contains(&"verify.workers"));
    assert!(failing.contains(&"verify.placements"));
}

#[tokio::test]
async fn verify_skips_placement_check_on_empty_cluster() {
    let db = Arc::new(FakeDb::bootstrapped().with_state(|st| {
        st.placements.clear();
    }));
    let verifier = ClusterVerifier::new(db, fast_config().cluster);

    let report = verifier.verify().await.unwrap();
    let placements = report
        .checks
        .iter()
        .find(|c| c.name == "verify.placements")
        .unwrap();
    assert_eq!(placements.status, StepStatus::Skipped);
}
