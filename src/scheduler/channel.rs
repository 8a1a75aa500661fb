use chrono::{DateTime, Utc};

use crate::bus::{BusError, KeySpace, SharedStore};
use crate::error::{BackendError, Result};
use crate::scheduler::job::BuildTask;

const PAYLOAD: &str = "payload";
const MEMBER: &str = "member";

fn broker(e: BusError) -> BackendError {
    BackendError::Broker(e.to_string())
}

/// Queue member name; the zero-padded timestamp keeps members in FIFO order.
fn member_name(task_id: &str, now: DateTime<Utc>) -> String {
    format!("{:013}:{}", now.timestamp_millis().max(0), task_id)
}

/// The job-queue channel between the job grabber and the workers.
///
/// Every build group has its own queue set on the coordination store. A
/// worker owns a task once its removal of the queue member succeeded, the same
/// way VM checkout works. Any failure talking to the store is a broker error.
#[derive(Clone)]
pub struct JobChannel {
    store: SharedStore,
    keys: KeySpace,
}

impl JobChannel {
    /// Open the channel; fails if the store cannot be reached.
    pub async fn open(store: SharedStore, keys: KeySpace) -> Result<Self> {
        store.ping().await.map_err(|e| {
            BackendError::Broker(format!("cannot open job queue channel: {}", e))
        })?;
        Ok(Self { store, keys })
    }

    /// Fails with a broker error once the store is gone.
    pub async fn check(&self) -> Result<()> {
        self.store
            .ping()
            .await
            .map_err(|e| BackendError::Broker(format!("job queue channel lost: {}", e)))
    }

    /// Queue a task for its group. Returns false if it was queued before.
    ///
    /// A failure part way through forgets the task again so a later enqueue
    /// can retry it.
    pub async fn enqueue(&self, task: &BuildTask, now: DateTime<Utc>) -> Result<bool> {
        if !self
            .store
            .set_add(&self.keys.task_known(), &task.task_id)
            .await
            .map_err(broker)?
        {
            return Ok(false);
        }

        if let Err(e) = self.write_queued(task, now).await {
            tracing::error!(task_id = %task.task_id, error = %e, "Failed to queue task");
            if let Err(undo_err) = self.finish(&task.task_id).await {
                tracing::error!(
                    task_id = %task.task_id,
                    error = %undo_err,
                    "Cannot forget half-queued task"
                );
            }
            return Err(e);
        }

        tracing::info!(task_id = %task.task_id, group_id = task.group_id, "Task queued");
        Ok(true)
    }

    async fn write_queued(&self, task: &BuildTask, now: DateTime<Utc>) -> Result<()> {
        let member = member_name(&task.task_id, now);
        let payload = serde_json::to_string(task).map_err(|e| broker(e.into()))?;
        self.store
            .hash_set(
                &self.keys.task(&task.task_id),
                &[(PAYLOAD, payload), (MEMBER, member.clone())],
            )
            .await
            .map_err(broker)?;
        self.store
            .set_add(&self.keys.task_queue(task.group_id), &member)
            .await
            .map_err(broker)?;
        Ok(())
    }

    /// Take the oldest task of the group, if any.
    ///
    /// If the task cannot be read back the member is returned to the queue.
    /// A task whose payload is gone or unreadable is forgotten instead, so the
    /// grabber can queue it afresh.
    pub async fn claim(&self, group_id: u32) -> Result<Option<BuildTask>> {
        let queue = self.keys.task_queue(group_id);
        let mut members = self.store.set_members(&queue).await.map_err(broker)?;
        members.sort();

        for member in members {
            if !self.store.set_remove(&queue, &member).await.map_err(broker)? {
                continue;
            }
            let Some((_, task_id)) = member.split_once(':') else {
                tracing::warn!(member, "Dropping malformed queue member");
                continue;
            };

            let key = self.keys.task(task_id);
            let raw = match self.store.hash_get(&key, PAYLOAD).await {
                Ok(raw) => raw,
                Err(e) => {
                    if let Err(undo_err) = self.store.set_add(&queue, &member).await {
                        tracing::error!(task_id, error = %undo_err, "Cannot return task to the queue");
                    }
                    return Err(broker(e));
                }
            };
            let parsed = raw.map(|raw| serde_json::from_str::<BuildTask>(&raw));
            match parsed {
                Some(Ok(task)) => return Ok(Some(task)),
                Some(Err(e)) => {
                    tracing::warn!(task_id, error = %e, "Queued task is unreadable, forgetting it")
                }
                None => tracing::warn!(task_id, "Queued task has no payload, forgetting it"),
            }
            self.finish(task_id).await?;
        }
        Ok(None)
    }

    /// Put a claimed task back at its original position.
    pub async fn requeue(&self, task: &BuildTask) -> Result<()> {
        let member = self
            .store
            .hash_get(&self.keys.task(&task.task_id), MEMBER)
            .await
            .map_err(broker)?
            .unwrap_or_else(|| member_name(&task.task_id, Utc::now()));
        self.store
            .set_add(&self.keys.task_queue(task.group_id), &member)
            .await
            .map_err(broker)?;
        tracing::info!(task_id = %task.task_id, group_id = task.group_id, "Task requeued");
        Ok(())
    }

    /// Requeue a task known only by id, e.g. the one a dead worker held.
    /// Returns false when the task is no longer tracked.
    pub async fn requeue_id(&self, task_id: &str) -> Result<bool> {
        let key = self.keys.task(task_id);
        let Some(raw) = self.store.hash_get(&key, PAYLOAD).await.map_err(broker)? else {
            return Ok(false);
        };
        let task: BuildTask = serde_json::from_str(&raw).map_err(|e| {
            broker(BusError::Malformed {
                key,
                reason: e.to_string(),
            })
        })?;
        self.requeue(&task).await?;
        Ok(true)
    }

    /// Forget a task that has been built; the grabber may queue it again later.
    pub async fn finish(&self, task_id: &str) -> Result<()> {
        self.store
            .delete(&self.keys.task(task_id))
            .await
            .map_err(broker)?;
        self.store
            .set_remove(&self.keys.task_known(), task_id)
            .await
            .map_err(broker)?;
        Ok(())
    }

    pub async fn queued(&self, group_id: u32) -> Result<usize> {
        Ok(self
            .store
            .set_members(&self.keys.task_queue(group_id))
            .await
            .map_err(broker)?
            .len())
    }

    /// Drop every queued task of the given groups.
    pub async fn clean(&self, group_ids: &[u32]) -> Result<()> {
        for &group_id in group_ids {
            let queue = self.keys.task_queue(group_id);
            for member in self.store.set_members(&queue).await.map_err(broker)? {
                if !self.store.set_remove(&queue, &member).await.map_err(broker)? {
                    continue;
                }
                if let Some((_, task_id)) = member.split_once(':') {
                    self.finish(task_id).await?;
                }
            }
            tracing::info!(group_id, "Job queue cleaned");
        }
        Ok(())
    }
}
