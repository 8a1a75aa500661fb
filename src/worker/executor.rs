use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::{render_command, BuilderConfig};
use crate::scheduler::{BuildStatus, BuildTask};
use crate::vm::VmDescriptor;

const BUILD_LOG: &str = "builder.log";

/// How a build ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Finished { exit_code: Option<i32> },
    TimedOut,
    Interrupted,
}

/// Result of one build run.
#[derive(Debug)]
pub struct ExecutionResult {
    pub task_id: String,
    pub status: BuildStatus,
    pub outcome: BuildOutcome,
    pub result_dir: PathBuf,
}

/// Runs the external builder for one task on a checked-out VM.
///
/// The builder's output goes to `builder.log` in the task's result
/// directory. A build can end three ways: the builder exits, the timeout
/// fires, or the cancellation token is triggered (interrupt or shutdown).
#[derive(Debug, Clone)]
pub struct BuildExecutor {
    config: BuilderConfig,
    results_dir: PathBuf,
}

impl BuildExecutor {
    pub fn new(config: BuilderConfig, results_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            results_dir: results_dir.into(),
        }
    }

    pub fn result_dir(&self, task: &BuildTask) -> PathBuf {
        self.results_dir
            .join(&task.project_owner)
            .join(&task.project_name)
            .join(&task.task_id)
    }

    fn argv(&self, task: &BuildTask, vm: &VmDescriptor, result_dir: &Path) -> Vec<String> {
        let build_id = task.build_id.to_string();
        let result_dir = result_dir.display().to_string();
        render_command(
            &self.config.command,
            &[
                ("vm_ip", vm.vm_ip.as_str()),
                ("vm_name", vm.vm_name.as_str()),
                ("task_id", task.task_id.as_str()),
                ("build_id", build_id.as_str()),
                ("chroot", task.chroot.as_deref().unwrap_or("srpm-builds")),
                ("result_dir", result_dir.as_str()),
            ],
        )
    }

    /// Run the build. An `Err` means the builder could not be started at all,
    /// which is an infrastructure failure rather than a failed build.
    pub async fn execute(
        &self,
        task: &BuildTask,
        vm: &VmDescriptor,
        cancel: CancellationToken,
    ) -> std::io::Result<ExecutionResult> {
        let result_dir = self.result_dir(task);
        tokio::fs::create_dir_all(&result_dir).await?;
        let log = std::fs::File::create(result_dir.join(BUILD_LOG))?;
        let log_err = log.try_clone()?;

        let argv = self.argv(task, vm, &result_dir);
        let Some((program, args)) = argv.split_first() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty builder command",
            ));
        };

        tracing::info!(
            task_id = %task.task_id,
            vm_name = %vm.vm_name,
            vm_ip = %vm.vm_ip,
            program,
            "Starting build"
        );

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()?;

        let timeout = Duration::from_secs(self.config.timeout);
        let outcome = tokio::select! {
            status = child.wait() => BuildOutcome::Finished { exit_code: status?.code() },
            _ = tokio::time::sleep(timeout) => {
                let _ = child.kill().await;
                BuildOutcome::TimedOut
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                BuildOutcome::Interrupted
            }
        };

        let status = match outcome {
            BuildOutcome::Finished { exit_code: Some(0) } => BuildStatus::Succeeded,
            _ => BuildStatus::Failure,
        };

        tracing::info!(
            task_id = %task.task_id,
            status = %status,
            outcome = ?outcome,
            "Build completed"
        );

        Ok(ExecutionResult {
            task_id: task.task_id.clone(),
            status,
            outcome,
            result_dir,
        })
    }
}
