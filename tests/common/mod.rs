//! Common test utilities: in-memory fakes for the coordinator database and
//! the container runtime, with scriptable failure queues.

#![allow(dead_code)]

use async_trait::async_trait;
use shardpilot::config::{HaConfig, PilotConfig, RetryConfig};
use shardpilot::db::CoordinatorClient;
use shardpilot::error::{PilotError, Result};
use shardpilot::runtime::{ContainerRuntime, ExecOutput};
use shardpilot::types::ShardPlacementSnapshot;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// A table known to the fake coordinator.
#[derive(Debug, Clone)]
pub struct FakeTable {
    pub columns: Vec<String>,
    pub has_pk: bool,
    pub rows: u64,
    /// Whether the table counts as distributed (replica identity matters).
    pub distributed: bool,
}

impl FakeTable {
    pub fn new(columns: &[&str], has_pk: bool, rows: u64, distributed: bool) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            has_pk,
            rows,
            distributed,
        }
    }
}

#[derive(Default)]
pub struct DbState {
    pub coordinator: Option<(String, u16)>,
    pub workers: Vec<(String, u16)>,
    pub placements: Vec<(String, u64)>,
    pub tables: HashMap<String, FakeTable>,
    pub markers: HashMap<(String, String), u64>,
    pub extension: Option<String>,
    /// Errors consumed, in order, by the next `add_worker` calls.
    pub add_worker_errors: VecDeque<PilotError>,
    /// Errors consumed by the next `set_coordinator_host` calls.
    pub set_coordinator_errors: VecDeque<PilotError>,
    /// Scripted results consumed, in order, by the next `count_rows` calls.
    /// Unscripted calls fall through to the table's actual row count.
    pub count_rows_script: VecDeque<Result<u64>>,
    /// Errors consumed by the next `drain_node` calls.
    pub drain_errors: VecDeque<PilotError>,
}

/// In-memory [`CoordinatorClient`].
pub struct FakeDb {
    pub state: Mutex<DbState>,
}

impl FakeDb {
    /// An empty coordinator: no host set, no workers, extension installed.
    pub fn empty() -> Self {
        let state = DbState {
            extension: Some("citus".to_string()),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// A cluster matching `PilotConfig::development()` after bootstrap.
    pub fn bootstrapped() -> Self {
        let db = Self::empty();
        {
            let mut st = db.state.lock().unwrap();
            st.coordinator = Some(("coordinator".to_string(), 5432));
            st.workers = vec![
                ("worker-0".to_string(), 5432),
                ("worker-1".to_string(), 5432),
            ];
            st.placements = vec![("worker-0".to_string(), 16), ("worker-1".to_string(), 16)];
            st.tables.insert(
                "observations".to_string(),
                FakeTable::new(&["id", "value"], true, 100, true),
            );
        }
        db
    }

    pub fn with_state(self, f: impl FnOnce(&mut DbState)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }
}

#[async_trait]
impl CoordinatorClient for FakeDb {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn coordinator_host(&self) -> Result<Option<(String, u16)>> {
        Ok(self.state.lock().unwrap().coordinator.clone())
    }

    async fn set_coordinator_host(&self, host: &str, port: u16) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if let Some(e) = st.set_coordinator_errors.pop_front() {
            return Err(e);
        }
        st.coordinator = Some((host.to_string(), port));
        Ok(())
    }

    async fn active_workers(&self) -> Result<Vec<(String, u16)>> {
        Ok(self.state.lock().unwrap().workers.clone())
    }

    async fn add_worker(&self, host: &str, port: u16) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if let Some(e) = st.add_worker_errors.pop_front() {
            return Err(e);
        }
        if !st.workers.iter().any(|(h, p)| h == host && *p == port) {
            st.workers.push((host.to_string(), port));
        }
        Ok(())
    }

    async fn rebalance_shards(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let total: u64 = st.placements.iter().map(|(_, c)| c).sum();
        let workers: Vec<String> = st.workers.iter().map(|(h, _)| h.clone()).collect();
        if workers.is_empty() {
            return Err(PilotError::RebalanceFailed("no active workers".to_string()));
        }
        let share = total / workers.len() as u64;
        st.placements = workers.into_iter().map(|w| (w, share)).collect();
        Ok(())
    }

    async fn drain_node(&self, host: &str, _port: u16) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if let Some(e) = st.drain_errors.pop_front() {
            return Err(e);
        }
        let moved: u64 = st
            .placements
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c)
            .sum();
        let others = st.placements.iter().filter(|(h, _)| h != host).count().max(1) as u64;
        for (h, c) in st.placements.iter_mut() {
            if h == host {
                *c = 0;
            } else {
                *c += moved / others;
            }
        }
        Ok(())
    }

    async fn shard_placements(&self) -> Result<Vec<ShardPlacementSnapshot>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .placements
            .iter()
            .map(|(h, c)| ShardPlacementSnapshot::new(h.clone(), *c))
            .collect())
    }

    async fn tables_missing_replica_identity(&self) -> Result<Vec<String>> {
        let st = self.state.lock().unwrap();
        let mut missing: Vec<String> = st
            .tables
            .iter()
            .filter(|(_, t)| t.distributed && !t.has_pk)
            .map(|(name, _)| name.clone())
            .collect();
        missing.sort();
        Ok(missing)
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().tables.contains_key(table))
    }

    async fn has_primary_key(&self, table: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map(|t| t.has_pk)
            .unwrap_or(false))
    }

    async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map(|t| t.columns.iter().any(|c| c == column))
            .unwrap_or(false))
    }

    async fn add_primary_key(&self, table: &str, _column: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        match st.tables.get_mut(table) {
            Some(t) => {
                t.has_pk = true;
                Ok(())
            }
            None => Err(PilotError::TableNotFound(table.to_string())),
        }
    }

    async fn extension_version(&self, name: &str) -> Result<Option<String>> {
        let st = self.state.lock().unwrap();
        Ok(match &st.extension {
            Some(ext) if ext == name => Some("12.1".to_string()),
            _ => None,
        })
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        let mut st = self.state.lock().unwrap();
        if let Some(scripted) = st.count_rows_script.pop_front() {
            return scripted;
        }
        st.tables
            .get(table)
            .map(|t| t.rows)
            .ok_or_else(|| PilotError::TableNotFound(table.to_string()))
    }

    async fn insert_markers(&self, table: &str, tag: &str, count: u32) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.tables
            .entry(table.to_string())
            .or_insert_with(|| FakeTable::new(&["tag", "seq"], false, 0, false))
            .rows += u64::from(count);
        *st.markers
            .entry((table.to_string(), tag.to_string()))
            .or_insert(0) += u64::from(count);
        Ok(())
    }

    async fn count_markers(&self, table: &str, tag: &str) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .markers
            .get(&(table.to_string(), tag.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn roundtrip_check(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct RuntimeState {
    /// Running pods per service.
    pub pods: HashMap<String, Vec<String>>,
    /// Not-ready polls remaining per service before a replacement appears.
    pub ready_after: HashMap<String, u32>,
    /// Pods that have been deleted, in order.
    pub deleted: Vec<String>,
    pub version_error: Option<PilotError>,
}

/// In-memory [`ContainerRuntime`].
pub struct FakeRuntime {
    pub state: Mutex<RuntimeState>,
    /// Not-ready polls a deleted pod's service goes through before recovery.
    pub recovery_polls: u32,
}

impl FakeRuntime {
    /// Pods for the development topology, recovering after two polls.
    pub fn healthy() -> Self {
        let mut pods = HashMap::new();
        for service in ["db-coordinator", "db-worker-0", "db-worker-1"] {
            pods.insert(service.to_string(), vec![format!("{}-0", service)]);
        }
        Self {
            state: Mutex::new(RuntimeState {
                pods,
                ..Default::default()
            }),
            recovery_polls: 2,
        }
    }

    pub fn with_state(self, f: impl FnOnce(&mut RuntimeState)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn version(&self) -> Result<String> {
        let mut st = self.state.lock().unwrap();
        match st.version_error.take() {
            Some(e) => Err(e),
            None => Ok("v1.30.0".to_string()),
        }
    }

    async fn list_running(&self, service: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .get(service)
            .cloned()
            .unwrap_or_default())
    }

    async fn exec(&self, _service: &str, _command: &[&str]) -> Result<ExecOutput> {
        Err(PilotError::Internal(
            "exec is not supported by the fake runtime".to_string(),
        ))
    }

    async fn delete_pod(&self, pod: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let mut owner = None;
        for (service, pods) in st.pods.iter_mut() {
            if let Some(idx) = pods.iter().position(|p| p == pod) {
                pods.remove(idx);
                owner = Some(service.clone());
                break;
            }
        }
        st.deleted.push(pod.to_string());
        if let Some(service) = owner {
            st.ready_after.insert(service, self.recovery_polls);
        }
        Ok(())
    }

    async fn is_ready(&self, service: &str) -> Result<bool> {
        let mut st = self.state.lock().unwrap();
        if let Some(remaining) = st.ready_after.get_mut(service) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(false);
            }
            st.ready_after.remove(service);
            let replacement = format!("{}-respawned", service);
            st.pods.entry(service.to_string()).or_default().push(replacement);
        }
        Ok(st.pods.get(service).map(|p| !p.is_empty()).unwrap_or(false))
    }
}

/// Development config with millisecond timings for fast tests.
pub fn fast_config() -> PilotConfig {
    let mut config = PilotConfig::development();
    config.retry = RetryConfig {
        register_attempts: 5,
        register_backoff: Duration::from_millis(1),
        coordinator_attempts: 8,
        coordinator_backoff: Duration::from_millis(1),
        poll_interval: Duration::from_millis(1),
        poll_timeout: Duration::from_millis(500),
    };
    config.ha = HaConfig {
        outage_probes: 10,
        probe_interval: Duration::from_millis(1),
        recovery_timeout: Duration::from_millis(500),
        recovery_poll_interval: Duration::from_millis(1),
        settle_delay: Duration::from_millis(1),
        min_availability: 0.8,
        dataset_table: "observations".to_string(),
        marker_table: "ha_markers".to_string(),
        marker_rows: 5,
        forward_port: None,
    };
    config
}
