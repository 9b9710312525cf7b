//! Orchestration runtime collaborator.
//!
//! The cluster is driven through the narrow [`ContainerRuntime`] contract:
//! list running pods for a service, exec a command inside one, delete a pod,
//! and check readiness. The production implementation shells out to
//! `kubectl` with an explicit timeout on every call; tests substitute an
//! in-memory fake.

use crate::config::RuntimeConfig;
use crate::error::{PilotError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Output of a command executed inside a pod.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub exit_code: i32,
}

/// Narrow contract against the container/orchestration runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Control-plane reachability check; the version string on success.
    async fn version(&self) -> Result<String>;

    /// Running pod names for a service (label `app=<service>`).
    async fn list_running(&self, service: &str) -> Result<Vec<String>>;

    /// Execute a command inside the first running pod of a service.
    async fn exec(&self, service: &str, command: &[&str]) -> Result<ExecOutput>;

    /// Forcibly remove one pod. Destructive; callers gate this explicitly.
    async fn delete_pod(&self, pod: &str) -> Result<()>;

    /// Whether a service has a running pod reporting the Ready condition.
    async fn is_ready(&self, service: &str) -> Result<bool>;
}

/// `kubectl`-backed runtime.
pub struct KubectlRuntime {
    config: RuntimeConfig,
}

impl KubectlRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    async fn run(&self, args: &[&str]) -> Result<ExecOutput> {
        debug!(kubectl = %self.config.kubectl_path, ?args, "Running runtime command");

        let child = Command::new(&self.config.kubectl_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                PilotError::ControlPlaneUnreachable(format!(
                    "failed to launch {}: {}",
                    self.config.kubectl_path, e
                ))
            })?;

        let output = tokio::time::timeout(self.config.exec_timeout, child.wait_with_output())
            .await
            .map_err(|_| PilotError::Timeout(self.config.exec_timeout.as_millis() as u64))??;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if exit_code != 0 {
            return Err(classify_runtime_error(exit_code, &stderr));
        }

        Ok(ExecOutput { stdout, exit_code })
    }
}

/// Map kubectl stderr onto the error taxonomy at the process boundary, so
/// core logic never inspects command output text.
fn classify_runtime_error(code: i32, stderr: &str) -> PilotError {
    let lower = stderr.to_lowercase();
    if lower.contains("connection refused") || lower.contains("unable to connect") {
        PilotError::ConnectionRefused(stderr.trim().to_string())
    } else if lower.contains("the server could not find") || lower.contains("no route to host") {
        PilotError::ControlPlaneUnreachable(stderr.trim().to_string())
    } else {
        PilotError::CommandFailed {
            code,
            stderr: stderr.trim().to_string(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for KubectlRuntime {
    async fn version(&self) -> Result<String> {
        let out = self.run(&["version", "--output=yaml"]).await.map_err(|e| {
            // A missing binary or unreachable API server is fatal for the run.
            match e {
                PilotError::CommandFailed { stderr, .. } => {
                    PilotError::ControlPlaneUnreachable(stderr)
                }
                other => other,
            }
        })?;
        Ok(out.stdout.trim().to_string())
    }

    async fn list_running(&self, service: &str) -> Result<Vec<String>> {
        let selector = format!("app={}", service);
        let out = self
            .run(&[
                "get",
                "pods",
                "-n",
                &self.config.namespace,
                "-l",
                &selector,
                "--field-selector=status.phase=Running",
                "-o",
                "name",
            ])
            .await?;

        Ok(out
            .stdout
            .lines()
            .filter_map(|line| line.trim().strip_prefix("pod/"))
            .map(|s| s.to_string())
            .collect())
    }

    async fn exec(&self, service: &str, command: &[&str]) -> Result<ExecOutput> {
        let pods = self.list_running(service).await?;
        let pod = pods.first().ok_or_else(|| {
            PilotError::NotReady(format!("no running pod for service {}", service))
        })?;

        let mut args = vec!["exec", "-n", self.config.namespace.as_str(), pod.as_str(), "--"];
        args.extend_from_slice(command);
        self.run(&args).await
    }

    async fn delete_pod(&self, pod: &str) -> Result<()> {
        info!(pod, "Deleting pod");
        self.run(&["delete", "pod", "-n", &self.config.namespace, pod, "--wait=false"])
            .await?;
        Ok(())
    }

    async fn is_ready(&self, service: &str) -> Result<bool> {
        let pods = self.list_running(service).await?;
        let Some(pod_name) = pods.first() else {
            return Ok(false);
        };

        let out = self
            .run(&[
                "get",
                "pod",
                "-n",
                &self.config.namespace,
                pod_name,
                "-o",
                r#"jsonpath={.status.conditions[?(@.type=="Ready")].status}"#,
            ])
            .await?;

        Ok(out.stdout.trim() == "True")
    }
}

/// A detached `kubectl port-forward` tunnel to the coordinator.
///
/// The child process lives independently of the main control flow but its
/// handle (and PID) is tracked here, and the process is killed on drop so
/// every exit path releases it.
pub struct PortForwardTunnel {
    child: Child,
    pid: Option<u32>,
    target: String,
}

impl PortForwardTunnel {
    /// Spawn a tunnel `localhost:<local_port> -> <service>:<remote_port>`.
    pub fn spawn(
        config: &RuntimeConfig,
        service: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Self> {
        let target = format!("svc/{}", service);
        let ports = format!("{}:{}", local_port, remote_port);

        let child = Command::new(&config.kubectl_path)
            .args(["port-forward", "-n", &config.namespace, &target, &ports])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PilotError::ControlPlaneUnreachable(format!("failed to start port-forward: {}", e))
            })?;

        let pid = child.id();
        info!(target = %target, ports = %ports, ?pid, "Port-forward tunnel started");

        Ok(Self { child, pid, target })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Tear the tunnel down and reap the child.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(target = %self.target, error = %e, "Failed to kill port-forward tunnel");
            return;
        }
        let _ = self.child.wait().await;
        info!(target = %self.target, "Port-forward tunnel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_connection_refused() {
        let err = classify_runtime_error(1, "error: connection refused to 10.0.0.1:6443");
        assert!(matches!(err, PilotError::ConnectionRefused(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_classify_unknown_failure_keeps_exit_code() {
        let err = classify_runtime_error(127, "some unexpected failure");
        match err {
            PilotError::CommandFailed { code, stderr } => {
                assert_eq!(code, 127);
                assert_eq!(stderr, "some unexpected failure");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_classify_missing_server_is_fatal_class() {
        let err = classify_runtime_error(1, "The server could not find the requested resource");
        assert!(matches!(err, PilotError::ControlPlaneUnreachable(_)));
        assert!(err.is_fatal());
    }
}
