use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, Result};

/// One independent partition of build capacity, usually an architecture class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildGroup {
    pub id: u32,
    pub name: String,
    pub archs: Vec<String>,
    pub max_workers: usize,
    /// Upper bound on VMs (any state) the VM manager keeps for this group.
    #[serde(default = "default_max_vm_total")]
    pub max_vm_total: usize,
    /// Minimum seconds between two spawn requests for this group.
    #[serde(default = "default_vm_spawn_min_interval")]
    pub vm_spawn_min_interval: u64,
}

impl BuildGroup {
    pub fn new(id: u32, name: &str, archs: &[&str], max_workers: usize) -> Self {
        Self {
            id,
            name: name.to_string(),
            archs: archs.iter().map(|a| a.to_string()).collect(),
            max_workers,
            max_vm_total: default_max_vm_total(),
            vm_spawn_min_interval: default_vm_spawn_min_interval(),
        }
    }

    pub fn supports_arch(&self, arch: &str) -> bool {
        self.archs.iter().any(|a| a == arch)
    }

    pub fn vm_spawn_min_interval(&self) -> Duration {
        Duration::from_secs(self.vm_spawn_min_interval)
    }
}

fn default_max_vm_total() -> usize {
    4
}

fn default_vm_spawn_min_interval() -> u64 {
    30
}

/// Time constants for the VM manager, all in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// How often a health check is invoked.
    pub health_check_period: u64,
    /// Without a successful check for this long the VM is force-failed.
    pub health_check_max_time: u64,
    /// Consecutive failed checks before termination starts.
    pub max_check_fails: u32,
    /// Time before a termination request is sent again.
    pub terminating_timeout: u64,
    /// Period of the VM manager's scheduling cycle.
    pub cycle_timeout: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            health_check_period: 10,
            health_check_max_time: 120,
            max_check_fails: 2,
            terminating_timeout: 600,
            cycle_timeout: 10,
        }
    }
}

impl Thresholds {
    pub fn health_check_period(&self) -> Duration {
        Duration::from_secs(self.health_check_period)
    }

    pub fn health_check_max_time(&self) -> Duration {
        Duration::from_secs(self.health_check_max_time)
    }

    pub fn terminating_timeout(&self) -> Duration {
        Duration::from_secs(self.terminating_timeout)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout)
    }
}

/// Connection to the coordination store shared by all backend processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub endpoints: Vec<String>,
    /// Prefix for every key and topic, so several deployments can share a store.
    pub namespace: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            namespace: "buildfarm:backend:".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontendConfig {
    pub base_url: String,
    /// Shared secret for the authenticated backend endpoints.
    pub auth: String,
    #[serde(default = "default_frontend_timeout")]
    pub timeout: u64,
}

fn default_frontend_timeout() -> u64 {
    30
}

/// Substitute `{name}` placeholders in every argument of a command template.
pub fn render_command(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{}}}", name), value)
            })
        })
        .collect()
}

/// Probe used to decide whether a VM is reachable and usable.
///
/// `{vm_ip}` and `{vm_name}` in the command are substituted before running it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub command: Vec<String>,
    pub timeout: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            command: ["ssh", "-o", "BatchMode=yes", "root@{vm_ip}", "echo", "ok"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timeout: 30,
        }
    }
}

/// External build executor invoked by workers for every task.
///
/// Placeholders: `{vm_ip}`, `{vm_name}`, `{task_id}`, `{build_id}`, `{chroot}`, `{result_dir}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    pub command: Vec<String>,
    pub timeout: u64,
    /// Seconds a worker waits before asking for a VM again.
    pub vm_wait_interval: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            command: [
                "buildfarm-build",
                "--vm",
                "{vm_ip}",
                "--task",
                "{task_id}",
                "--chroot",
                "{chroot}",
                "--results",
                "{result_dir}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            timeout: 6 * 3600,
            vm_wait_interval: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub build_groups: Vec<BuildGroup>,
    /// Seconds between two reconciliation cycles of the daemon.
    #[serde(default = "default_sleeptime")]
    pub sleeptime: u64,
    /// Treat the death of any worker as fatal.
    #[serde(default)]
    pub exit_on_worker: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Architecture used to route tasks that carry no chroot (SRPM builds).
    #[serde(default = "default_srpm_build_arch")]
    pub srpm_build_arch: String,
    #[serde(default)]
    pub dashboard_addr: Option<SocketAddr>,
    #[serde(default)]
    pub bus: BusConfig,
    pub frontend: FrontendConfig,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub builder: BuilderConfig,
}

fn default_sleeptime() -> u64 {
    10
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/buildfarm")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("/var/lib/buildfarm/results")
}

fn default_srpm_build_arch() -> String {
    "x86_64".to_string()
}

impl BackendConfig {
    pub fn new(build_groups: Vec<BuildGroup>, frontend: FrontendConfig) -> Self {
        Self {
            build_groups,
            sleeptime: default_sleeptime(),
            exit_on_worker: false,
            log_dir: default_log_dir(),
            log_level: default_log_level(),
            results_dir: default_results_dir(),
            srpm_build_arch: default_srpm_build_arch(),
            dashboard_addr: None,
            bus: BusConfig::default(),
            frontend,
            thresholds: Thresholds::default(),
            health_check: HealthCheckConfig::default(),
            builder: BuilderConfig::default(),
        }
    }

    pub fn sleeptime(&self) -> Duration {
        Duration::from_secs(self.sleeptime)
    }

    pub fn group(&self, group_id: u32) -> Option<&BuildGroup> {
        self.build_groups.iter().find(|g| g.id == group_id)
    }

    /// First declared group building `arch`.
    pub fn group_for_arch(&self, arch: &str) -> Option<&BuildGroup> {
        self.build_groups.iter().find(|g| g.supports_arch(arch))
    }

    pub fn validate(&self) -> Result<()> {
        if self.build_groups.is_empty() {
            return Err(BackendError::Configuration(
                "no build groups configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for group in &self.build_groups {
            if !seen.insert(group.id) {
                return Err(BackendError::Configuration(format!(
                    "duplicate build group id {}",
                    group.id
                )));
            }
            if group.max_workers == 0 {
                return Err(BackendError::Configuration(format!(
                    "build group {} must allow at least one worker",
                    group.name
                )));
            }
            if group.archs.is_empty() {
                return Err(BackendError::Configuration(format!(
                    "build group {} has no architectures",
                    group.name
                )));
            }
        }

        if self.sleeptime == 0 {
            return Err(BackendError::Configuration(
                "sleeptime must be positive".to_string(),
            ));
        }

        let t = &self.thresholds;
        if t.max_check_fails == 0 || t.health_check_period == 0 || t.cycle_timeout == 0 {
            return Err(BackendError::Configuration(
                "max_check_fails, health_check_period and cycle_timeout must be positive"
                    .to_string(),
            ));
        }

        if self.builder.command.is_empty() || self.health_check.command.is_empty() {
            return Err(BackendError::Configuration(
                "builder and health check commands must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Reads the configuration file. Every call re-reads the source.
#[derive(Debug, Clone)]
pub struct ConfigReader {
    path: PathBuf,
}

impl ConfigReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<Arc<BackendConfig>> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            BackendError::Configuration(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let config = Self::parse(&raw).map_err(|e| match e {
            BackendError::Configuration(msg) => {
                BackendError::Configuration(format!("{}: {}", self.path.display(), msg))
            }
            other => other,
        })?;
        Ok(Arc::new(config))
    }

    pub fn parse(raw: &str) -> Result<BackendConfig> {
        let config: BackendConfig =
            serde_yaml::from_str(raw).map_err(|e| BackendError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
