use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::BuildGroup;
use crate::error::{BackendError, Result};
use crate::worker::process::{ProcessHandle, WorkerSpawner};

/// Name a worker process goes by on the bus, e.g. as the holder of a VM.
pub fn worker_name(group_id: u32, worker_num: usize) -> String {
    format!("worker-{}-{}", group_id, worker_num)
}

/// One supervised worker process.
pub struct WorkerHandle {
    pub group_id: u32,
    pub worker_num: usize,
    pub start_time: DateTime<Utc>,
    process: Box<dyn ProcessHandle>,
}

impl WorkerHandle {
    pub fn new(group_id: u32, worker_num: usize, process: Box<dyn ProcessHandle>) -> Self {
        Self {
            group_id,
            worker_num,
            start_time: Utc::now(),
            process,
        }
    }

    pub fn name(&self) -> String {
        worker_name(self.group_id, self.worker_num)
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn is_alive(&mut self) -> bool {
        self.process.is_alive()
    }

    pub fn terminate(&mut self) {
        self.process.terminate();
    }

    pub async fn join(&mut self, timeout: Duration) -> bool {
        self.process.join(timeout).await
    }
}

/// Keeps `max_workers` live worker processes for one build group.
pub struct WorkerPool {
    group: BuildGroup,
    workers: Vec<WorkerHandle>,
    next_worker_num: usize,
    /// Workers removed since the last `take_departed`.
    departed: Vec<String>,
}

impl WorkerPool {
    pub fn new(group: BuildGroup) -> Self {
        Self {
            group,
            workers: Vec::new(),
            next_worker_num: 0,
            departed: Vec::new(),
        }
    }

    pub fn group(&self) -> &BuildGroup {
        &self.group
    }

    /// Apply a reloaded group definition; takes effect on the next top-up.
    pub fn set_group(&mut self, group: BuildGroup) {
        self.group = group;
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Track an already running worker.
    pub fn push(&mut self, handle: WorkerHandle) {
        self.next_worker_num = self.next_worker_num.max(handle.worker_num + 1);
        self.workers.push(handle);
    }

    pub fn alive_count(&mut self) -> usize {
        self.workers
            .iter_mut()
            .map(|w| w.is_alive())
            .filter(|alive| *alive)
            .count()
    }

    /// Start as many workers as needed to reach `max_workers` live ones.
    /// Returns the number of workers started.
    pub fn spin_up_to_capacity(&mut self, spawner: &dyn WorkerSpawner) -> usize {
        let alive = self.alive_count();
        let deficit = self.group.max_workers.saturating_sub(alive);
        let mut started = 0;

        for _ in 0..deficit {
            let worker_num = self.next_worker_num;
            self.next_worker_num += 1;

            let mut process = spawner.spawn(&self.group, worker_num);
            if let Err(e) = process.start() {
                tracing::error!(
                    group_id = self.group.id,
                    worker_num,
                    error = %e,
                    "Failed to start worker"
                );
                continue;
            }
            let handle = WorkerHandle::new(self.group.id, worker_num, process);
            tracing::info!(
                group_id = self.group.id,
                worker_num,
                pid = ?handle.pid(),
                "Started worker"
            );
            self.workers.push(handle);
            started += 1;
        }

        started
    }

    /// Remove dead workers after calling their termination hook.
    ///
    /// With `fail_fast`, finding any dead worker is an error, reported only
    /// after the pool has been cleaned up.
    pub fn prune_dead(&mut self, fail_fast: bool) -> Result<usize> {
        let mut dead = 0;
        let group_id = self.group.id;
        let departed = &mut self.departed;
        self.workers.retain_mut(|worker| {
            if worker.is_alive() {
                return true;
            }
            tracing::warn!(group_id, worker_num = worker.worker_num, "Worker died, removing");
            worker.terminate();
            departed.push(worker.name());
            dead += 1;
            false
        });

        if fail_fast && dead > 0 {
            return Err(BackendError::WorkerDied {
                group_id,
                count: dead,
            });
        }
        Ok(dead)
    }

    /// Terminate every tracked worker, alive or not, and hand the handles
    /// back so the caller can wait for them to exit.
    pub fn terminate_all(&mut self) -> Vec<WorkerHandle> {
        let mut stopped: Vec<WorkerHandle> = self.workers.drain(..).collect();
        for worker in &mut stopped {
            tracing::info!(
                group_id = worker.group_id,
                worker_num = worker.worker_num,
                pid = ?worker.pid(),
                "Terminating worker"
            );
            worker.terminate();
            self.departed.push(worker.name());
        }
        stopped
    }

    /// Names of the workers pruned or terminated since the previous call.
    pub fn take_departed(&mut self) -> Vec<String> {
        std::mem::take(&mut self.departed)
    }
}
