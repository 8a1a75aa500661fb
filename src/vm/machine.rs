//! Health and lifecycle transition rules for a single VM.
//!
//! These functions only mutate a [`VmDescriptor`]; publishing events and
//! touching pool sets is left to [`VmManager`](crate::vm::VmManager). All time
//! comparisons take `now` explicitly so the rules can be driven by tests.

use chrono::{DateTime, Utc};

use crate::config::Thresholds;
use crate::vm::descriptor::VmDescriptor;
use crate::vm::state::VmState;

/// A state change applied to a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: VmState,
    pub to: VmState,
}

impl Transition {
    /// The VM was available for checkout and no longer is.
    pub fn leaves_pool(&self) -> bool {
        self.from == VmState::Ready && self.to != VmState::Ready
    }

    pub fn enters_pool(&self) -> bool {
        self.from != VmState::Ready && self.to == VmState::Ready
    }
}

/// Apply one health check result.
///
/// Returns `None` when the result does not apply: the VM is checked out or
/// already terminating.
pub fn apply_health_result(
    desc: &mut VmDescriptor,
    ok: bool,
    now: DateTime<Utc>,
    thresholds: &Thresholds,
) -> Option<Transition> {
    let from = desc.state;
    if !from.is_checked() {
        return None;
    }

    desc.last_health_check = Some(now);
    if ok {
        desc.check_fails = 0;
        desc.last_success = Some(now);
        desc.state = VmState::Ready;
    } else {
        desc.check_fails += 1;
        desc.state = if desc.check_fails >= thresholds.max_check_fails {
            VmState::Terminating
        } else {
            VmState::CheckHealthFailed
        };
    }

    Some(Transition {
        from,
        to: desc.state,
    })
}

/// No successful check within `health_check_max_time` of the last success,
/// release after a build, or spawn if the VM was never healthy.
pub fn watchdog_expired(desc: &VmDescriptor, now: DateTime<Utc>, thresholds: &Thresholds) -> bool {
    if !desc.state.is_checked() {
        return false;
    }
    elapsed_secs(desc.watchdog_since(), now) >= thresholds.health_check_max_time
}

/// A checked-out VM held longer than any build may take. Its worker is gone
/// or stuck.
pub fn checkout_expired(desc: &VmDescriptor, now: DateTime<Utc>, max_in_use_secs: u64) -> bool {
    if desc.state != VmState::InUse {
        return false;
    }
    match desc.in_use_since {
        Some(since) => elapsed_secs(since, now) >= max_in_use_secs,
        None => false,
    }
}

/// Fail the VM regardless of its counter. It goes straight to `Terminating`.
pub fn force_fail(
    desc: &mut VmDescriptor,
    now: DateTime<Utc>,
    thresholds: &Thresholds,
) -> Option<Transition> {
    let from = desc.state;
    if !from.is_checked() {
        return None;
    }
    desc.last_health_check = Some(now);
    desc.check_fails = desc.check_fails.max(thresholds.max_check_fails);
    desc.state = VmState::Terminating;
    Some(Transition {
        from,
        to: VmState::Terminating,
    })
}

/// The next probe of this VM is due.
pub fn check_due(desc: &VmDescriptor, now: DateTime<Utc>, thresholds: &Thresholds) -> bool {
    if !desc.state.is_checked() {
        return false;
    }
    match desc.last_health_check {
        None => true,
        Some(last) => elapsed_secs(last, now) >= thresholds.health_check_period,
    }
}

/// A terminating VM whose last termination request went unanswered for too long.
pub fn termination_retry_due(
    desc: &VmDescriptor,
    now: DateTime<Utc>,
    thresholds: &Thresholds,
) -> bool {
    if desc.state != VmState::Terminating {
        return false;
    }
    match desc.termination_requested_at {
        None => true,
        Some(at) => elapsed_secs(at, now) >= thresholds.terminating_timeout,
    }
}

fn elapsed_secs(since: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - since).num_seconds().max(0) as u64
}
