//! Configuration for shardpilot.
//!
//! One immutable [`PilotConfig`] value is loaded at startup and threaded
//! through every component constructor. Core logic never reads ambient
//! process state.

use crate::error::{PilotError, Result};
use crate::types::PkFixRequest;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a shardpilot run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PilotConfig {
    /// Cluster topology.
    pub cluster: ClusterConfig,
    /// Retry and polling policy.
    pub retry: RetryConfig,
    /// Primary-key repair allow-list.
    #[serde(default)]
    pub repair: RepairConfig,
    /// HA failure-injection harness parameters.
    pub ha: HaConfig,
    /// Orchestration runtime (kubectl) settings.
    pub runtime: RuntimeConfig,
    /// Report artifact settings.
    #[serde(default)]
    pub report: ReportConfig,
    /// Logging configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl PilotConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PilotError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| PilotError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.database.is_empty() {
            return Err(PilotError::InvalidConfig {
                field: "cluster.database".to_string(),
                reason: "Database name must be set".to_string(),
            });
        }

        if self.cluster.workers.is_empty() {
            return Err(PilotError::InvalidConfig {
                field: "cluster.workers".to_string(),
                reason: "At least one worker is required".to_string(),
            });
        }

        if self.cluster.expected_workers == 0
            || self.cluster.expected_workers > self.cluster.workers.len()
        {
            return Err(PilotError::InvalidConfig {
                field: "cluster.expected_workers".to_string(),
                reason: format!(
                    "Must be between 1 and the number of configured workers ({})",
                    self.cluster.workers.len()
                ),
            });
        }

        if self.retry.register_attempts == 0 || self.retry.coordinator_attempts == 0 {
            return Err(PilotError::InvalidConfig {
                field: "retry".to_string(),
                reason: "Attempt counts must be non-zero".to_string(),
            });
        }

        if self.ha.outage_probes == 0 {
            return Err(PilotError::InvalidConfig {
                field: "ha.outage_probes".to_string(),
                reason: "At least one outage probe is required".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.ha.min_availability) {
            return Err(PilotError::InvalidConfig {
                field: "ha.min_availability".to_string(),
                reason: "Must be a fraction between 0.0 and 1.0".to_string(),
            });
        }

        Ok(())
    }

    /// A minimal lab configuration: one coordinator, two workers.
    pub fn development() -> Self {
        Self {
            cluster: ClusterConfig {
                database: "appdb".to_string(),
                coordinator: NodeEndpoint::new("coordinator", 5432, "db-coordinator"),
                workers: vec![
                    NodeEndpoint::new("worker-0", 5432, "db-worker-0"),
                    NodeEndpoint::new("worker-1", 5432, "db-worker-1"),
                ],
                expected_workers: 2,
                extension: "citus".to_string(),
            },
            retry: RetryConfig::default(),
            repair: RepairConfig {
                pk_fix_list: vec![PkFixRequest::new("orders", "id")],
            },
            ha: HaConfig::default(),
            runtime: RuntimeConfig::default(),
            report: ReportConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// A database node endpoint plus the runtime object serving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    /// Hostname the coordinator uses to reach the node.
    pub host: String,
    /// Port the coordinator uses to reach the node.
    pub port: u16,
    /// Pod/service name known to the orchestration runtime.
    pub service: String,
}

impl NodeEndpoint {
    pub fn new(host: impl Into<String>, port: u16, service: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            service: service.into(),
        }
    }

    /// `host:port` form used in logs and attempt records.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Cluster topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Database name all commands run against.
    pub database: String,
    /// The coordinator node.
    pub coordinator: NodeEndpoint,
    /// Worker nodes to register.
    pub workers: Vec<NodeEndpoint>,
    /// Minimum active workers for verification to pass.
    pub expected_workers: usize,
    /// Sharding extension expected on the coordinator.
    #[serde(default = "default_extension")]
    pub extension: String,
}

fn default_extension() -> String {
    "citus".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            database: String::new(),
            coordinator: NodeEndpoint::new("coordinator", 5432, "db-coordinator"),
            workers: Vec::new(),
            expected_workers: 0,
            extension: default_extension(),
        }
    }
}

/// Retry and polling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Max attempts when registering one worker.
    pub register_attempts: u32,
    /// Fixed backoff between registration attempts.
    #[serde(with = "humantime_serde")]
    pub register_backoff: Duration,
    /// Max attempts when setting the coordinator host.
    pub coordinator_attempts: u32,
    /// Fixed backoff between coordinator-host attempts.
    #[serde(with = "humantime_serde")]
    pub coordinator_backoff: Duration,
    /// Default polling interval for readiness checks.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Default wall-clock timeout for readiness checks.
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            register_attempts: 5,
            register_backoff: Duration::from_secs(5),
            coordinator_attempts: 8,
            coordinator_backoff: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(60),
        }
    }
}

/// Primary-key repair allow-list.
///
/// Repairs run only over this explicit list, only as a pre-step to draining.
/// There is no schema-wide inference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepairConfig {
    #[serde(default)]
    pub pk_fix_list: Vec<PkFixRequest>,
}

/// HA failure-injection harness parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaConfig {
    /// Number of read probes during the outage window.
    pub outage_probes: u32,
    /// Interval between outage probes.
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    /// How long to wait for the removed node to become ready again.
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
    /// Polling interval while waiting for recovery.
    #[serde(with = "humantime_serde")]
    pub recovery_poll_interval: Duration,
    /// Settle delay before checking re-registration.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Minimum availability fraction for the run to pass.
    pub min_availability: f64,
    /// Dataset whose row count is the integrity baseline.
    pub dataset_table: String,
    /// Table holding the uniquely tagged marker rows.
    pub marker_table: String,
    /// Number of marker rows inserted at baseline.
    pub marker_rows: u32,
    /// Local port for an observation tunnel to the coordinator during the
    /// run. No tunnel is opened when unset.
    #[serde(default)]
    pub forward_port: Option<u16>,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            outage_probes: 10,
            probe_interval: Duration::from_secs(2),
            recovery_timeout: Duration::from_secs(180),
            recovery_poll_interval: Duration::from_secs(3),
            settle_delay: Duration::from_secs(10),
            min_availability: 0.8,
            dataset_table: "observations".to_string(),
            marker_table: "ha_markers".to_string(),
            marker_rows: 5,
            forward_port: None,
        }
    }
}

/// Orchestration runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Namespace all runtime operations target.
    pub namespace: String,
    /// Path to the kubectl binary.
    pub kubectl_path: String,
    /// Timeout for each runtime command.
    #[serde(with = "humantime_serde")]
    pub exec_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            kubectl_path: "kubectl".to_string(),
            exec_timeout: Duration::from_secs(30),
        }
    }
}

/// Report artifact settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Directory receiving one JSON artifact per run.
    pub dir: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("reports"),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime-style suffixes.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_development_config_is_valid() {
        let config = PilotConfig::development();
        config.validate().unwrap();
        assert_eq!(config.cluster.workers.len(), 2);
        assert_eq!(config.cluster.expected_workers, 2);
        assert_eq!(config.ha.outage_probes, 10);
    }

    #[test]
    fn test_validate_rejects_missing_database() {
        let mut config = PilotConfig::development();
        config.cluster.database.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_expected_workers_above_configured() {
        let mut config = PilotConfig::development();
        config.cluster.expected_workers = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_availability_threshold() {
        let mut config = PilotConfig::development();
        config.ha.min_availability = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_roundtrip() {
        let config = PilotConfig::development();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: PilotConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.ha.probe_interval, Duration::from_secs(2));
        assert_eq!(parsed.retry.register_backoff, Duration::from_secs(5));
    }

    #[test]
    fn test_node_endpoint_address() {
        let ep = NodeEndpoint::new("worker-0", 5432, "db-worker-0");
        assert_eq!(ep.address(), "worker-0:5432");
    }
}
