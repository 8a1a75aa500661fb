use chrono::{DateTime, Utc};

use crate::bus::{BusResult, KeySpace, SharedStore, Subscription, VmEvent};
use crate::config::Thresholds;
use crate::vm::descriptor::{decode_time, encode_time, VmDescriptor};
use crate::vm::machine::{self, Transition};
use crate::vm::state::VmState;

const LAST_VM_SPAWN_START: &str = "last_vm_spawn_start";

/// Every write to VM descriptors and pool sets goes through this type.
///
/// It holds no state of its own: the VM master process and each worker build
/// one over the shared store. Pool mutations are single atomic set operations;
/// checkout is exclusive because only one caller can remove a given member.
#[derive(Clone)]
pub struct VmManager {
    store: SharedStore,
    keys: KeySpace,
    thresholds: Thresholds,
}

impl VmManager {
    pub fn new(store: SharedStore, keys: KeySpace, thresholds: Thresholds) -> Self {
        Self {
            store,
            keys,
            thresholds,
        }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub async fn get_vm(&self, vm_name: &str) -> BusResult<Option<VmDescriptor>> {
        let key = self.keys.vm_instance(vm_name);
        let fields = self.store.hash_get_all(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        VmDescriptor::from_fields(&key, &fields).map(Some)
    }

    pub async fn all_vms(&self) -> BusResult<Vec<VmDescriptor>> {
        let mut vms = Vec::new();
        for name in self.store.set_members(&self.keys.vm_index()).await? {
            match self.get_vm(&name).await {
                Ok(Some(desc)) => vms.push(desc),
                Ok(None) => {}
                Err(e) => tracing::warn!(vm_name = %name, error = %e, "Skipping unreadable VM"),
            }
        }
        Ok(vms)
    }

    pub async fn vms_in_group(&self, group_id: u32) -> BusResult<Vec<VmDescriptor>> {
        Ok(self
            .all_vms()
            .await?
            .into_iter()
            .filter(|vm| vm.group_id == group_id)
            .collect())
    }

    /// Names currently available for checkout.
    pub async fn available(&self, group_id: u32) -> BusResult<Vec<String>> {
        self.store.set_members(&self.keys.vm_pool(group_id)).await
    }

    /// Register a freshly provisioned VM and queue it for its first check.
    ///
    /// A name that is already known is left untouched.
    pub async fn add_vm(
        &self,
        vm_name: &str,
        vm_ip: &str,
        group_id: u32,
        now: DateTime<Utc>,
    ) -> BusResult<VmDescriptor> {
        if let Some(existing) = self.get_vm(vm_name).await? {
            tracing::warn!(vm_name, group_id = existing.group_id, "VM already registered");
            return Ok(existing);
        }

        let mut desc = VmDescriptor::new(vm_name, vm_ip, group_id, now);
        self.save(&desc).await?;
        self.store.set_add(&self.keys.vm_index(), vm_name).await?;

        desc.state = VmState::CheckHealth;
        self.save_fields(vm_name, &[("state", desc.state.as_str().to_string())])
            .await?;
        tracing::info!(vm_name, vm_ip, group_id, "VM registered, awaiting health check");
        Ok(desc)
    }

    /// Apply a health check result to the named VM.
    pub async fn record_health(
        &self,
        vm_name: &str,
        ok: bool,
        now: DateTime<Utc>,
    ) -> BusResult<Option<Transition>> {
        let Some(mut desc) = self.get_vm(vm_name).await? else {
            tracing::debug!(vm_name, "Health result for unknown VM");
            return Ok(None);
        };
        let Some(tr) = machine::apply_health_result(&mut desc, ok, now, &self.thresholds) else {
            return Ok(None);
        };
        self.commit(desc, tr, now).await
    }

    /// Liveness watchdog: fail the VM even if its counter is below the threshold.
    pub async fn force_fail(
        &self,
        vm_name: &str,
        now: DateTime<Utc>,
    ) -> BusResult<Option<Transition>> {
        let Some(mut desc) = self.get_vm(vm_name).await? else {
            return Ok(None);
        };
        let Some(tr) = machine::force_fail(&mut desc, now, &self.thresholds) else {
            return Ok(None);
        };
        tracing::warn!(
            vm_name,
            since = %desc.watchdog_since(),
            "No successful health check in time, failing VM"
        );
        self.commit(desc, tr, now).await
    }

    async fn commit(
        &self,
        mut desc: VmDescriptor,
        tr: Transition,
        now: DateTime<Utc>,
    ) -> BusResult<Option<Transition>> {
        let pool = self.keys.vm_pool(desc.group_id);

        if tr.leaves_pool() && !self.store.set_remove(&pool, &desc.vm_name).await? {
            // A worker checked the VM out between our read and the removal.
            tracing::debug!(vm_name = %desc.vm_name, "VM was checked out, dropping health result");
            return Ok(None);
        }

        if tr.from == VmState::Ready && tr.to == VmState::Ready {
            // Leave `state` alone: a checkout may have happened meanwhile.
            self.save_fields(
                &desc.vm_name,
                &[
                    ("check_fails", desc.check_fails.to_string()),
                    ("last_health_check", encode_time(desc.last_health_check)),
                    ("last_success", encode_time(desc.last_success)),
                ],
            )
            .await?;
        } else {
            self.save(&desc).await?;
        }

        if tr.enters_pool() {
            self.store.set_add(&pool, &desc.vm_name).await?;
            tracing::info!(vm_name = %desc.vm_name, group_id = desc.group_id, "VM ready");
        }

        if tr.to == VmState::Terminating {
            self.request_termination(&mut desc, now).await?;
        } else if tr.to == VmState::CheckHealthFailed {
            tracing::warn!(
                vm_name = %desc.vm_name,
                check_fails = desc.check_fails,
                max_check_fails = self.thresholds.max_check_fails,
                "VM health check failed"
            );
        }

        Ok(Some(tr))
    }

    /// Check out a specific VM. Exactly one concurrent caller can succeed.
    pub async fn acquire_named(
        &self,
        group_id: u32,
        vm_name: &str,
        worker: &str,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> BusResult<Option<VmDescriptor>> {
        if !self
            .store
            .set_remove(&self.keys.vm_pool(group_id), vm_name)
            .await?
        {
            return Ok(None);
        }

        let Some(mut desc) = self.get_vm(vm_name).await? else {
            tracing::warn!(vm_name, "Pool member without descriptor, discarding");
            return Ok(None);
        };
        if desc.state != VmState::Ready {
            tracing::warn!(vm_name, state = %desc.state, "Pool member not ready, discarding");
            return Ok(None);
        }

        desc.state = VmState::InUse;
        desc.bound_to = Some(worker.to_string());
        desc.task_id = Some(task_id.to_string());
        desc.in_use_since = Some(now);
        self.save_fields(
            vm_name,
            &[
                ("state", desc.state.as_str().to_string()),
                ("bound_to", worker.to_string()),
                ("task_id", task_id.to_string()),
                ("in_use_since", encode_time(Some(now))),
            ],
        )
        .await?;
        tracing::info!(vm_name, worker, task_id, "VM checked out");
        Ok(Some(desc))
    }

    /// Check out any available VM of the group.
    pub async fn acquire_vm(
        &self,
        group_id: u32,
        worker: &str,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> BusResult<Option<VmDescriptor>> {
        for vm_name in self.available(group_id).await? {
            if let Some(desc) = self
                .acquire_named(group_id, &vm_name, worker, task_id, now)
                .await?
            {
                return Ok(Some(desc));
            }
        }
        Ok(None)
    }

    /// Return a checked-out VM to its pool. No-op unless the VM is `InUse`.
    ///
    /// The release restarts the liveness watchdog and makes the VM due for a
    /// health check on the next cycle.
    pub async fn release_vm(&self, vm_name: &str, now: DateTime<Utc>) -> BusResult<bool> {
        let Some(desc) = self.get_vm(vm_name).await? else {
            return Ok(false);
        };
        if desc.state != VmState::InUse {
            return Ok(false);
        }
        self.save_fields(
            vm_name,
            &[
                ("state", VmState::Ready.as_str().to_string()),
                ("bound_to", String::new()),
                ("task_id", String::new()),
                ("in_use_since", String::new()),
                ("released_at", encode_time(Some(now))),
                ("last_health_check", String::new()),
            ],
        )
        .await?;
        self.store
            .set_add(&self.keys.vm_pool(desc.group_id), vm_name)
            .await?;
        tracing::info!(vm_name, "VM released");
        Ok(true)
    }

    /// Take the VM out of service. Returns false if it was already terminating.
    pub async fn start_termination(&self, vm_name: &str, now: DateTime<Utc>) -> BusResult<bool> {
        let Some(mut desc) = self.get_vm(vm_name).await? else {
            return Ok(false);
        };
        if desc.state == VmState::Terminating {
            return Ok(false);
        }
        self.store
            .set_remove(&self.keys.vm_pool(desc.group_id), vm_name)
            .await?;
        desc.state = VmState::Terminating;
        self.save(&desc).await?;
        self.request_termination(&mut desc, now).await?;
        Ok(true)
    }

    /// Terminate the VMs still checked out by workers that are gone and
    /// return them as they were before termination.
    pub async fn terminate_held_by(
        &self,
        workers: &[String],
        now: DateTime<Utc>,
    ) -> BusResult<Vec<VmDescriptor>> {
        let mut reclaimed = Vec::new();
        if workers.is_empty() {
            return Ok(reclaimed);
        }
        for vm in self.all_vms().await? {
            if vm.state != VmState::InUse {
                continue;
            }
            let Some(holder) = vm.bound_to.as_deref() else {
                continue;
            };
            if !workers.iter().any(|w| w == holder) {
                continue;
            }
            tracing::warn!(
                vm_name = %vm.vm_name,
                worker = holder,
                "Worker left its VM checked out, terminating it"
            );
            if self.start_termination(&vm.vm_name, now).await? {
                reclaimed.push(vm);
            }
        }
        Ok(reclaimed)
    }

    /// Publish a termination request and remember when it was sent.
    pub async fn request_termination(
        &self,
        desc: &mut VmDescriptor,
        now: DateTime<Utc>,
    ) -> BusResult<()> {
        self.publish(&VmEvent::VmTerminationRequest {
            vm_name: desc.vm_name.clone(),
            vm_ip: desc.vm_ip.clone(),
            group_id: desc.group_id,
        })
        .await?;
        desc.termination_requested_at = Some(now);
        self.save_fields(
            &desc.vm_name,
            &[("termination_requested_at", encode_time(Some(now)))],
        )
        .await?;
        tracing::info!(vm_name = %desc.vm_name, vm_ip = %desc.vm_ip, "VM termination requested");
        Ok(())
    }

    /// The terminator confirmed the VM is gone; forget it. Safe to repeat.
    pub async fn confirm_terminated(&self, vm_name: &str) -> BusResult<()> {
        if let Some(desc) = self.get_vm(vm_name).await? {
            self.store
                .set_remove(&self.keys.vm_pool(desc.group_id), vm_name)
                .await?;
        }
        self.store.set_remove(&self.keys.vm_index(), vm_name).await?;
        self.store.delete(&self.keys.vm_instance(vm_name)).await?;
        tracing::info!(vm_name, "VM terminated");
        Ok(())
    }

    /// Ask the worker building on `vm_ip` to abort its build.
    pub async fn interrupt_build(&self, vm_ip: &str, reason: &str) -> BusResult<()> {
        self.store
            .publish(&self.keys.interrupt_topic(vm_ip), reason)
            .await
    }

    pub async fn publish(&self, event: &VmEvent) -> BusResult<()> {
        self.store
            .publish(&self.keys.vm_events(), &event.to_payload()?)
            .await
    }

    pub async fn subscribe_events(&self) -> BusResult<Subscription> {
        self.store.subscribe(&self.keys.vm_events()).await
    }

    pub async fn subscribe_interrupts(&self, vm_ip: &str) -> BusResult<Subscription> {
        self.store.subscribe(&self.keys.interrupt_topic(vm_ip)).await
    }

    pub async fn last_spawn_start(&self, group_id: u32) -> BusResult<Option<DateTime<Utc>>> {
        let key = self.keys.vm_pool_info(group_id);
        match self.store.hash_get(&key, LAST_VM_SPAWN_START).await? {
            Some(raw) => decode_time(&key, &raw),
            None => Ok(None),
        }
    }

    pub async fn mark_spawn_start(&self, group_id: u32, now: DateTime<Utc>) -> BusResult<()> {
        self.store
            .hash_set(
                &self.keys.vm_pool_info(group_id),
                &[(LAST_VM_SPAWN_START, encode_time(Some(now)))],
            )
            .await
    }

    async fn save(&self, desc: &VmDescriptor) -> BusResult<()> {
        self.store
            .hash_set(&self.keys.vm_instance(&desc.vm_name), &desc.to_fields())
            .await
    }

    async fn save_fields(&self, vm_name: &str, fields: &[(&str, String)]) -> BusResult<()> {
        self.store
            .hash_set(&self.keys.vm_instance(vm_name), fields)
            .await
    }
}
