use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::frontend::FrontendClient;
use crate::scheduler::{BuildStatus, BuildTask, JobChannel, TaskUpdate};
use crate::vm::{VmDescriptor, VmManager};
use crate::worker::executor::{BuildExecutor, BuildOutcome};
use crate::worker::pool::worker_name;

/// What happened to a claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Built(BuildStatus),
    /// The frontend no longer wants the task.
    Skipped,
    /// The task went back to the queue.
    Requeued,
}

/// Body of a worker process: claims tasks of one build group and builds each
/// on a VM checked out for it.
pub struct BuildWorker {
    name: String,
    group_id: u32,
    channel: JobChannel,
    vms: VmManager,
    frontend: Arc<dyn FrontendClient>,
    executor: BuildExecutor,
    vm_wait_interval: Duration,
    idle_interval: Duration,
}

impl BuildWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        group_id: u32,
        worker_num: usize,
        channel: JobChannel,
        vms: VmManager,
        frontend: Arc<dyn FrontendClient>,
        executor: BuildExecutor,
        vm_wait_interval: Duration,
        idle_interval: Duration,
    ) -> Self {
        Self {
            name: worker_name(group_id, worker_num),
            group_id,
            channel,
            vms,
            frontend,
            executor,
            vm_wait_interval,
            idle_interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(worker = %self.name, group_id = self.group_id, "Worker started");
        while !shutdown.is_cancelled() {
            match self.channel.claim(self.group_id).await? {
                Some(task) => {
                    let outcome = self.process(task, &shutdown).await?;
                    tracing::debug!(worker = %self.name, outcome = ?outcome, "Task done");
                }
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.idle_interval) => {}
                    }
                }
            }
        }
        tracing::info!(worker = %self.name, "Worker stopped");
        Ok(())
    }

    /// Handle one claimed task from start to end.
    ///
    /// The task is never dropped: when handling fails it goes back to the
    /// queue before the error is returned.
    pub async fn process(&self, task: BuildTask, shutdown: &CancellationToken) -> Result<TaskOutcome> {
        match self.handle(&task, shutdown).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(
                    task_id = %task.task_id,
                    error = %e,
                    "Task handling failed, returning it to the queue"
                );
                if let Err(requeue_err) = self.channel.requeue(&task).await {
                    tracing::error!(
                        task_id = %task.task_id,
                        error = %requeue_err,
                        "Cannot requeue task"
                    );
                }
                Err(e)
            }
        }
    }

    async fn handle(&self, task: &BuildTask, shutdown: &CancellationToken) -> Result<TaskOutcome> {
        match self.frontend.starting_build(task).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(task_id = %task.task_id, "Frontend cancelled the task, skipping");
                self.channel.finish(&task.task_id).await?;
                return Ok(TaskOutcome::Skipped);
            }
            Err(e) => {
                tracing::warn!(task_id = %task.task_id, error = %e, "Cannot confirm task start");
                self.channel.requeue(task).await?;
                return Ok(TaskOutcome::Requeued);
            }
        }

        let Some(vm) = self.wait_for_vm(task, shutdown).await? else {
            self.channel.requeue(task).await?;
            return Ok(TaskOutcome::Requeued);
        };

        self.build_on(task, &vm, shutdown).await
    }

    async fn wait_for_vm(
        &self,
        task: &BuildTask,
        shutdown: &CancellationToken,
    ) -> Result<Option<VmDescriptor>> {
        loop {
            if let Some(vm) = self
                .vms
                .acquire_vm(self.group_id, &self.name, &task.task_id, Utc::now())
                .await?
            {
                return Ok(Some(vm));
            }
            tracing::debug!(worker = %self.name, group_id = self.group_id, "No VM available");
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.vm_wait_interval) => {}
            }
        }
    }

    async fn build_on(
        &self,
        task: &BuildTask,
        vm: &VmDescriptor,
        shutdown: &CancellationToken,
    ) -> Result<TaskOutcome> {
        let cancel = shutdown.child_token();
        let mut interrupts = match self.vms.subscribe_interrupts(&vm.vm_ip).await {
            Ok(interrupts) => interrupts,
            Err(e) => {
                if let Err(release_err) = self.vms.release_vm(&vm.vm_name, Utc::now()).await {
                    tracing::error!(vm_name = %vm.vm_name, error = %release_err, "Cannot release VM");
                }
                return Err(e.into());
            }
        };
        let watcher = {
            let cancel = cancel.clone();
            let task_id = task.task_id.clone();
            tokio::spawn(async move {
                if let Some(reason) = interrupts.next().await {
                    tracing::info!(task_id = %task_id, reason = %reason, "Build interrupted");
                    cancel.cancel();
                }
            })
        };

        self.report(TaskUpdate::started(task, Utc::now())).await;
        let result = self.executor.execute(task, vm, cancel).await;
        watcher.abort();

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(
                    task_id = %task.task_id,
                    vm_name = %vm.vm_name,
                    error = %e,
                    "Builder could not run, giving up the VM"
                );
                self.vms.start_termination(&vm.vm_name, Utc::now()).await?;
                self.channel.requeue(task).await?;
                return Ok(TaskOutcome::Requeued);
            }
        };

        if result.outcome == BuildOutcome::Interrupted && shutdown.is_cancelled() {
            self.vms.release_vm(&vm.vm_name, Utc::now()).await?;
            self.channel.requeue(task).await?;
            return Ok(TaskOutcome::Requeued);
        }

        self.report(TaskUpdate::ended(
            task,
            result.status,
            Some(result.result_dir.display().to_string()),
            Utc::now(),
        ))
        .await;
        self.vms.release_vm(&vm.vm_name, Utc::now()).await?;
        self.channel.finish(&task.task_id).await?;
        Ok(TaskOutcome::Built(result.status))
    }

    async fn report(&self, update: TaskUpdate) {
        if let Err(e) = self.frontend.update(std::slice::from_ref(&update)).await {
            tracing::warn!(task_id = %update.task_id, error = %e, "Cannot report task state");
        }
    }
}
