use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::bus::{KeySpace, ServerInfo, SharedStore};
use crate::config::{BackendConfig, ConfigReader};
use crate::error::{BackendError, Result};
use crate::frontend::FrontendClient;
use crate::scheduler::JobChannel;
use crate::vm::VmManager;
use crate::worker::{WorkerHandle, WorkerPool, WorkerSpawner};

const WORKER_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStatus {
    pub group_id: u32,
    pub name: String,
    pub max_workers: usize,
    pub workers: usize,
}

/// Snapshot published after every cycle, read by the diagnostics endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub server_start: Option<DateTime<Utc>>,
    pub last_cycle: Option<DateTime<Utc>>,
    pub groups: Vec<GroupStatus>,
}

/// The backend daemon: owns the job-queue channel and one worker pool per
/// build group, and reconciles them every `sleeptime` seconds.
///
/// # Cycle
///
/// 1. Reload the configuration
/// 2. Check the job-queue channel is still there
/// 3. For every group in declared order: prune dead workers, then top up
/// 4. Sleep until the next cycle or until shutdown is requested
pub struct BackendDaemon {
    reader: Option<ConfigReader>,
    config: Option<Arc<BackendConfig>>,
    store: SharedStore,
    spawner: Arc<dyn WorkerSpawner>,
    frontend: Option<Arc<dyn FrontendClient>>,
    channel: Option<JobChannel>,
    vms: Option<VmManager>,
    pools: Vec<WorkerPool>,
    stopping: Vec<WorkerHandle>,
    /// Workers of removed groups whose VMs are still to be checked.
    departed: Vec<String>,
    running: bool,
    terminated: bool,
    server_start: Option<DateTime<Utc>>,
    status: watch::Sender<DaemonStatus>,
}

impl BackendDaemon {
    pub fn new(
        config_path: Option<PathBuf>,
        store: SharedStore,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Self {
        let (status, _) = watch::channel(DaemonStatus::default());
        Self {
            reader: config_path.map(ConfigReader::new),
            config: None,
            store,
            spawner,
            frontend: None,
            channel: None,
            vms: None,
            pools: Vec::new(),
            stopping: Vec::new(),
            departed: Vec::new(),
            running: false,
            terminated: false,
            server_start: None,
            status,
        }
    }

    pub fn with_frontend(mut self, frontend: Arc<dyn FrontendClient>) -> Self {
        self.frontend = Some(frontend);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn config(&self) -> Option<Arc<BackendConfig>> {
        self.config.clone()
    }

    pub fn pool(&self, group_id: u32) -> Option<&WorkerPool> {
        self.pools.iter().find(|p| p.group().id == group_id)
    }

    pub fn pool_mut(&mut self, group_id: u32) -> Option<&mut WorkerPool> {
        self.pools.iter_mut().find(|p| p.group().id == group_id)
    }

    pub fn subscribe_status(&self) -> watch::Receiver<DaemonStatus> {
        self.status.subscribe()
    }

    fn reader(&self) -> Result<&ConfigReader> {
        self.reader
            .as_ref()
            .ok_or_else(|| BackendError::Configuration("no configuration file given".to_string()))
    }

    /// Load the configuration and open the job-queue channel.
    pub async fn init(&mut self) -> Result<()> {
        let config = self.reader()?.read()?;
        let keys = KeySpace::new(config.bus.namespace.clone());

        let channel = JobChannel::open(self.store.clone(), keys.clone()).await?;
        let info = ServerInfo::record_start(self.store.as_ref(), &keys, Utc::now())
            .await
            .map_err(|e| BackendError::Broker(e.to_string()))?;

        if let Some(frontend) = &self.frontend {
            if let Err(e) = frontend.reschedule_all_running().await {
                tracing::warn!(error = %e, "Cannot reschedule builds left running");
            }
        }

        self.pools = config
            .build_groups
            .iter()
            .cloned()
            .map(WorkerPool::new)
            .collect();
        self.server_start = Some(info.server_start);
        self.vms = Some(VmManager::new(
            self.store.clone(),
            keys.clone(),
            config.thresholds.clone(),
        ));
        self.channel = Some(channel);
        self.config = Some(config);
        self.running = true;
        self.terminated = false;

        tracing::info!(
            groups = self.pools.len(),
            namespace = %keys.prefix(),
            "Backend initialized"
        );
        self.publish_status();
        Ok(())
    }

    /// Re-read the configuration. A failed reload keeps the previous one.
    pub async fn update_conf(&mut self) -> Result<()> {
        let config = match self.reader()?.read() {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "Configuration reload failed, keeping the previous one");
                return Ok(());
            }
        };

        let mut previous = std::mem::take(&mut self.pools);
        let mut pools = Vec::with_capacity(config.build_groups.len());
        for group in &config.build_groups {
            match previous.iter().position(|p| p.group().id == group.id) {
                Some(idx) => {
                    let mut pool = previous.remove(idx);
                    pool.set_group(group.clone());
                    pools.push(pool);
                }
                None => {
                    tracing::info!(group_id = group.id, name = %group.name, "New build group");
                    pools.push(WorkerPool::new(group.clone()));
                }
            }
        }
        for mut removed in previous {
            tracing::info!(group_id = removed.group().id, "Build group removed, stopping its workers");
            self.stopping.extend(removed.terminate_all());
            self.departed.extend(removed.take_departed());
        }

        self.pools = pools;
        self.config = Some(config);
        Ok(())
    }

    /// One reconciliation pass.
    pub async fn cycle(&mut self) -> Result<()> {
        self.update_conf().await?;
        let Some(channel) = &self.channel else {
            return Err(BackendError::Fatal("cycle before init".to_string()));
        };
        channel.check().await?;

        let fail_fast = self
            .config
            .as_ref()
            .map(|c| c.exit_on_worker)
            .unwrap_or(false);
        for pool in &mut self.pools {
            pool.prune_dead(fail_fast)?;
            pool.spin_up_to_capacity(self.spawner.as_ref());
        }

        self.reap_stopped().await;
        self.reclaim_vms().await;
        self.publish_status();
        Ok(())
    }

    /// Run until `shutdown` fires or a fatal error occurs. Either way every
    /// worker is terminated before returning.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        if !self.running {
            self.init().await?;
        }
        tracing::info!("Backend started");

        let result = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }
            if let Err(e) = self.cycle().await {
                tracing::error!(error = %e, "Backend cycle failed");
                break Err(e);
            }
            let sleeptime = self
                .config
                .as_ref()
                .map(|c| c.sleeptime())
                .unwrap_or(Duration::from_secs(10));
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep(sleeptime) => {}
            }
        };

        self.terminate().await;
        result
    }

    /// Stop every worker, tear down the VMs they still hold and clean the job
    /// queue. Only the first call acts.
    pub async fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.running = false;
        tracing::info!("Terminating backend");

        for pool in &mut self.pools {
            self.stopping.extend(pool.terminate_all());
        }
        // Workers requeue their task on the way out, so clean after they exit.
        self.reap_stopped().await;
        self.reclaim_vms().await;

        if let Some(channel) = &self.channel {
            let groups: Vec<u32> = self.pools.iter().map(|p| p.group().id).collect();
            if let Err(e) = channel.clean(&groups).await {
                tracing::error!(error = %e, "Failed to clean job queue");
            }
        }

        self.publish_status();
    }

    async fn reap_stopped(&mut self) {
        for mut worker in self.stopping.drain(..) {
            if !worker.join(WORKER_EXIT_TIMEOUT).await {
                tracing::warn!(
                    group_id = worker.group_id,
                    worker_num = worker.worker_num,
                    "Worker did not stop in time"
                );
            }
        }
    }

    /// Terminate the VMs left checked out by workers that are gone and put
    /// their tasks back in the queue.
    async fn reclaim_vms(&mut self) {
        let mut gone = std::mem::take(&mut self.departed);
        for pool in &mut self.pools {
            gone.extend(pool.take_departed());
        }
        let Some(vms) = &self.vms else {
            return;
        };
        let reclaimed = match vms.terminate_held_by(&gone, Utc::now()).await {
            Ok(reclaimed) => reclaimed,
            Err(e) => {
                tracing::error!(error = %e, "Failed to reclaim VMs of stopped workers");
                return;
            }
        };
        let Some(channel) = &self.channel else {
            return;
        };
        for task_id in reclaimed.iter().filter_map(|vm| vm.task_id.as_deref()) {
            if let Err(e) = channel.requeue_id(task_id).await {
                tracing::error!(task_id, error = %e, "Failed to requeue task of a stopped worker");
            }
        }
    }

    fn publish_status(&self) {
        let groups = self
            .pools
            .iter()
            .map(|p| GroupStatus {
                group_id: p.group().id,
                name: p.group().name.clone(),
                max_workers: p.group().max_workers,
                workers: p.len(),
            })
            .collect();
        self.status.send_replace(DaemonStatus {
            running: self.running,
            server_start: self.server_start,
            last_cycle: Some(Utc::now()),
            groups,
        });
    }
}
