use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::BackendConfig;
use crate::error::Result;
use crate::frontend::FrontendClient;
use crate::scheduler::channel::JobChannel;
use crate::scheduler::job::BuildTask;

/// Fills the job channel with pending tasks polled from the frontend.
pub struct JobGrabber {
    config: Arc<BackendConfig>,
    frontend: Arc<dyn FrontendClient>,
    channel: JobChannel,
}

impl JobGrabber {
    pub fn new(
        config: Arc<BackendConfig>,
        frontend: Arc<dyn FrontendClient>,
        channel: JobChannel,
    ) -> Self {
        Self {
            config,
            frontend,
            channel,
        }
    }

    /// Build group for the task: the one building the chroot's architecture,
    /// or the SRPM architecture when there is no chroot.
    pub fn route(&self, task: &BuildTask) -> Option<u32> {
        let arch = task.arch().unwrap_or(&self.config.srpm_build_arch);
        self.config.group_for_arch(arch).map(|g| g.id)
    }

    /// One poll of the frontend. Returns the number of newly queued tasks.
    pub async fn poll_once(&self) -> Result<usize> {
        let tasks = match self.frontend.pending_jobs().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot fetch pending jobs, retrying next cycle");
                return Ok(0);
            }
        };

        let mut queued = 0;
        for mut task in tasks {
            let Some(group_id) = self.route(&task) else {
                tracing::error!(
                    task_id = %task.task_id,
                    chroot = ?task.chroot,
                    "No build group for task architecture"
                );
                continue;
            };
            task.group_id = group_id;
            if self.channel.enqueue(&task, Utc::now()).await? {
                queued += 1;
            }
        }
        Ok(queued)
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(base_url = %self.config.frontend.base_url, "Job grabber started");
        loop {
            let queued = self.poll_once().await?;
            if queued > 0 {
                tracing::info!(queued, "Picked up new tasks");
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Job grabber shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.sleeptime()) => {}
            }
        }
    }
}
