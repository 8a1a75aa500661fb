use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::{render_command, HealthCheckConfig};
use crate::vm::descriptor::VmDescriptor;

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub ok: bool,
    pub msg: String,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            ok: true,
            msg: String::new(),
        }
    }

    pub fn unhealthy(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            msg: msg.into(),
        }
    }
}

#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, vm: &VmDescriptor) -> HealthReport;
}

/// Runs the configured command against the VM; exit status 0 means healthy.
#[derive(Debug, Clone)]
pub struct CommandHealthChecker {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandHealthChecker {
    pub fn new(config: &HealthCheckConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout),
        }
    }
}

#[async_trait]
impl HealthChecker for CommandHealthChecker {
    async fn check(&self, vm: &VmDescriptor) -> HealthReport {
        let argv = render_command(
            &self.command,
            &[("vm_ip", &vm.vm_ip), ("vm_name", &vm.vm_name)],
        );
        let Some((program, args)) = argv.split_first() else {
            return HealthReport::unhealthy("empty health check command");
        };

        let result = timeout(self.timeout, async {
            Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output()
                .await
        })
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => HealthReport::healthy(),
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                tracing::debug!(vm_name = %vm.vm_name, code = ?output.status.code(), "Health check failed");
                HealthReport::unhealthy(if stderr.is_empty() {
                    format!("exit code {:?}", output.status.code())
                } else {
                    stderr
                })
            }
            Ok(Err(e)) => {
                tracing::debug!(vm_name = %vm.vm_name, error = %e, "Health check command failed to execute");
                HealthReport::unhealthy(e.to_string())
            }
            Err(_) => {
                tracing::debug!(vm_name = %vm.vm_name, "Health check timed out");
                HealthReport::unhealthy("timed out")
            }
        }
    }
}
