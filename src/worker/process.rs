use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::config::BuildGroup;

/// An OS process supervised by a worker pool.
///
/// The pool only ever talks to this trait, so tests can drive it with a
/// simulated process.
#[async_trait]
pub trait ProcessHandle: Send {
    fn start(&mut self) -> std::io::Result<()>;

    fn pid(&self) -> Option<u32>;

    /// Non-blocking liveness poll.
    fn is_alive(&mut self) -> bool;

    /// Ask the process to stop. Safe to call on a dead or unstarted process.
    fn terminate(&mut self);

    /// Wait for the process to exit. Returns false on timeout.
    async fn join(&mut self, timeout: Duration) -> bool;
}

/// Creates (but does not start) worker processes for a build group.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, group: &BuildGroup, worker_num: usize) -> Box<dyn ProcessHandle>;
}

/// A child process running a command.
pub struct ChildProcess {
    program: PathBuf,
    args: Vec<String>,
    child: Option<Child>,
}

impl ChildProcess {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: None,
        }
    }
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    fn start(&mut self) -> std::io::Result<()> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.child = Some(child);
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    fn is_alive(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(_))) | None => false,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Cannot poll worker process");
                false
            }
        }
    }

    fn terminate(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        // No pid once the child has been reaped.
        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "SIGTERM failed, killing");
                let _ = child.start_kill();
            }
        }
    }

    async fn join(&mut self, timeout: Duration) -> bool {
        let Some(child) = self.child.as_mut() else {
            return true;
        };
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(pid = ?child.id(), "Worker did not exit in time, killing");
                let _ = child.start_kill();
                false
            }
        }
    }
}

/// Spawns workers by re-executing this binary with the `worker` subcommand.
#[derive(Debug, Clone)]
pub struct ChildSpawner {
    exe: PathBuf,
    config_path: PathBuf,
}

impl ChildSpawner {
    pub fn new(exe: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            exe: exe.into(),
            config_path: config_path.into(),
        }
    }

    pub fn current_exe(config_path: impl Into<PathBuf>) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, config_path))
    }

    fn worker_args(&self, group: &BuildGroup, worker_num: usize) -> Vec<String> {
        vec![
            "worker".to_string(),
            "--config".to_string(),
            self.config_path.display().to_string(),
            "--group-id".to_string(),
            group.id.to_string(),
            "--worker-num".to_string(),
            worker_num.to_string(),
        ]
    }
}

impl WorkerSpawner for ChildSpawner {
    fn spawn(&self, group: &BuildGroup, worker_num: usize) -> Box<dyn ProcessHandle> {
        Box::new(ChildProcess::new(
            self.exe.clone(),
            self.worker_args(group, worker_num),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_args_name_group_and_number() {
        let spawner = ChildSpawner::new("/usr/bin/buildfarm", "/etc/buildfarm.yaml");
        let group = BuildGroup::new(3, "ARM", &["armv7"], 1);
        assert_eq!(
            spawner.worker_args(&group, 2),
            [
                "worker",
                "--config",
                "/etc/buildfarm.yaml",
                "--group-id",
                "3",
                "--worker-num",
                "2"
            ]
        );
    }

    #[tokio::test]
    async fn test_child_lifecycle() {
        let mut proc = ChildProcess::new("sleep", vec!["30".to_string()]);
        assert!(!proc.is_alive());
        proc.start().unwrap();
        assert!(proc.pid().is_some());
        assert!(proc.is_alive());

        proc.terminate();
        assert!(proc.join(Duration::from_secs(5)).await);
        assert!(!proc.is_alive());

        // Terminating a reaped process is a no-op.
        proc.terminate();
    }

    #[tokio::test]
    async fn test_exited_child_is_dead() {
        let mut proc = ChildProcess::new("true", Vec::new());
        proc.start().unwrap();
        assert!(proc.join(Duration::from_secs(5)).await);
        assert!(!proc.is_alive());
    }
}
