use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Lifecycle state of a build VM.
///
/// `GotIp -> CheckHealth -> {Ready | CheckHealthFailed} -> Terminating`,
/// with `Ready <-> InUse` while the VM is healthy and checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    GotIp,
    CheckHealth,
    CheckHealthFailed,
    Ready,
    InUse,
    Terminating,
}

const NAMES: [(VmState, &str); 6] = [
    (VmState::GotIp, "got_ip"),
    (VmState::CheckHealth, "check_health"),
    (VmState::CheckHealthFailed, "check_health_failed"),
    (VmState::Ready, "ready"),
    (VmState::InUse, "in_use"),
    (VmState::Terminating, "terminating"),
];

impl VmState {
    pub fn as_str(self) -> &'static str {
        NAMES
            .iter()
            .find(|(state, _)| *state == self)
            .map(|(_, name)| *name)
            .unwrap_or("unknown")
    }

    /// States whose VM is probed on every health check period.
    pub fn is_checked(self) -> bool {
        matches!(
            self,
            VmState::GotIp | VmState::CheckHealth | VmState::CheckHealthFailed | VmState::Ready
        )
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmState {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NAMES
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(state, _)| *state)
            .ok_or_else(|| BackendError::UnknownVmState(s.to_string()))
    }
}
