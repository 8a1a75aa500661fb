use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusResult, VmEvent};
use crate::config::{BuildGroup, BuilderConfig};
use crate::error::{BackendError, Result};
use crate::vm::descriptor::VmDescriptor;
use crate::vm::health::HealthChecker;
use crate::vm::machine;
use crate::vm::manager::VmManager;
use crate::vm::state::VmState;

/// What one scheduling cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub probes_started: usize,
    pub force_failed: usize,
    pub termination_retries: usize,
    /// Checked-out VMs taken back from a worker that held them too long.
    pub reclaimed: usize,
    pub spawn_requests: Vec<u32>,
}

/// The VM Manager process: drives health checks, the watchdog, termination
/// retries and spawn requests, and applies events arriving on the VM topic.
///
/// Ticks and events are handled one at a time by [`VmMaster::run`], so all
/// transitions of a single VM are evaluated sequentially.
pub struct VmMaster {
    manager: VmManager,
    checker: Arc<dyn HealthChecker>,
    groups: Vec<BuildGroup>,
    probing: Arc<Mutex<HashSet<String>>>,
    max_in_use: u64,
}

impl VmMaster {
    pub fn new(manager: VmManager, checker: Arc<dyn HealthChecker>, groups: Vec<BuildGroup>) -> Self {
        let max_in_use = BuilderConfig::default().timeout + manager.thresholds().health_check_max_time;
        Self {
            manager,
            checker,
            groups,
            probing: Arc::new(Mutex::new(HashSet::new())),
            max_in_use,
        }
    }

    /// Seconds a VM may stay checked out before it is reclaimed. Should exceed
    /// the builder timeout.
    pub fn with_max_in_use(mut self, secs: u64) -> Self {
        self.max_in_use = secs;
        self
    }

    pub fn manager(&self) -> &VmManager {
        &self.manager
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut events = self.manager.subscribe_events().await?;
        let mut ticker = tokio::time::interval(self.manager.thresholds().cycle_timeout());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(groups = self.groups.len(), "VM manager started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("VM manager shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        tracing::error!(error = %e, "VM manager cycle failed");
                    }
                }
                msg = events.next() => {
                    let Some(payload) = msg else {
                        return Err(BackendError::Broker("VM event subscription closed".to_string()));
                    };
                    match VmEvent::from_payload(&payload) {
                        Ok(event) => {
                            if let Err(e) = self.handle_event(&event, Utc::now()).await {
                                tracing::error!(event = event.name(), error = %e, "Failed to apply VM event");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Ignoring malformed VM event"),
                    }
                }
            }
        }
    }

    /// One scheduling cycle evaluated at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> BusResult<TickReport> {
        let thresholds = self.manager.thresholds().clone();
        let mut report = TickReport::default();

        for vm in self.manager.all_vms().await? {
            if machine::watchdog_expired(&vm, now, &thresholds) {
                if self.manager.force_fail(&vm.vm_name, now).await?.is_some() {
                    report.force_failed += 1;
                }
            } else if machine::termination_retry_due(&vm, now, &thresholds) {
                tracing::warn!(vm_name = %vm.vm_name, "Termination not confirmed, requesting again");
                let mut vm = vm;
                self.manager.request_termination(&mut vm, now).await?;
                report.termination_retries += 1;
            } else if machine::checkout_expired(&vm, now, self.max_in_use) {
                tracing::warn!(
                    vm_name = %vm.vm_name,
                    bound_to = ?vm.bound_to,
                    "VM checked out for too long, reclaiming"
                );
                self.manager
                    .interrupt_build(&vm.vm_ip, "VM checkout expired")
                    .await?;
                if self.manager.start_termination(&vm.vm_name, now).await? {
                    report.reclaimed += 1;
                }
            } else if machine::check_due(&vm, now, &thresholds) && self.start_probe(vm) {
                report.probes_started += 1;
            }
        }

        for group in &self.groups {
            if self.request_spawn_if_needed(group, now).await? {
                report.spawn_requests.push(group.id);
            }
        }

        Ok(report)
    }

    /// Run the health check in the background; the result comes back as an event.
    fn start_probe(&self, vm: VmDescriptor) -> bool {
        match self.probing.lock() {
            Ok(mut probing) => {
                if !probing.insert(vm.vm_name.clone()) {
                    return false;
                }
            }
            Err(_) => return false,
        }

        let checker = self.checker.clone();
        let manager = self.manager.clone();
        let probing = self.probing.clone();
        tokio::spawn(async move {
            let report = checker.check(&vm).await;
            let event = VmEvent::HealthCheck {
                vm_name: vm.vm_name.clone(),
                vm_ip: vm.vm_ip.clone(),
                ok: report.ok,
                msg: report.msg,
            };
            if let Err(e) = manager.publish(&event).await {
                tracing::error!(vm_name = %vm.vm_name, error = %e, "Failed to publish health check result");
            }
            if let Ok(mut probing) = probing.lock() {
                probing.remove(&vm.vm_name);
            }
        });
        true
    }

    async fn request_spawn_if_needed(&self, group: &BuildGroup, now: DateTime<Utc>) -> BusResult<bool> {
        let alive = self
            .manager
            .vms_in_group(group.id)
            .await?
            .iter()
            .filter(|vm| vm.state != VmState::Terminating)
            .count();
        if alive >= group.max_vm_total {
            return Ok(false);
        }

        if let Some(last) = self.manager.last_spawn_start(group.id).await? {
            let elapsed = (now - last).num_seconds().max(0) as u64;
            if elapsed < group.vm_spawn_min_interval {
                return Ok(false);
            }
        }

        self.manager
            .publish(&VmEvent::VmSpawnRequest { group_id: group.id })
            .await?;
        self.manager.mark_spawn_start(group.id, now).await?;
        tracing::info!(group_id = group.id, alive, max = group.max_vm_total, "Requested a new VM");
        Ok(true)
    }

    /// Apply one event from the VM topic. Requests meant for the provisioner
    /// and terminator are ignored here.
    pub async fn handle_event(&self, event: &VmEvent, now: DateTime<Utc>) -> BusResult<()> {
        match event {
            VmEvent::VmSpawned {
                vm_name,
                vm_ip,
                group_id,
            } => {
                if self.groups.iter().any(|g| g.id == *group_id) {
                    self.manager.add_vm(vm_name, vm_ip, *group_id, now).await?;
                } else {
                    tracing::warn!(vm_name, group_id, "VM spawned for unknown build group");
                }
            }
            VmEvent::HealthCheck {
                vm_name, ok, msg, ..
            } => {
                if !ok {
                    tracing::debug!(vm_name, msg, "Negative health check");
                }
                self.manager.record_health(vm_name, *ok, now).await?;
            }
            VmEvent::VmTerminated { vm_name } => {
                self.manager.confirm_terminated(vm_name).await?;
            }
            VmEvent::VmSpawnRequest { .. } | VmEvent::VmTerminationRequest { .. } => {}
        }
        Ok(())
    }
}
