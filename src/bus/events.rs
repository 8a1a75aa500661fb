use serde::{Deserialize, Serialize};

use crate::bus::BusError;

/// Messages on the VM event topic. The `topic` field names the variant on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum VmEvent {
    /// The provisioner has a new VM with an address.
    VmSpawned {
        vm_name: String,
        vm_ip: String,
        group_id: u32,
    },
    /// Result of one probe.
    HealthCheck {
        vm_name: String,
        vm_ip: String,
        ok: bool,
        #[serde(default)]
        msg: String,
    },
    VmSpawnRequest { group_id: u32 },
    VmTerminationRequest {
        vm_name: String,
        vm_ip: String,
        group_id: u32,
    },
    /// The terminator confirmed the VM is gone.
    VmTerminated { vm_name: String },
}

impl VmEvent {
    pub fn name(&self) -> &'static str {
        match self {
            VmEvent::VmSpawned { .. } => "vm_spawned",
            VmEvent::HealthCheck { .. } => "health_check",
            VmEvent::VmSpawnRequest { .. } => "vm_spawn_request",
            VmEvent::VmTerminationRequest { .. } => "vm_termination_request",
            VmEvent::VmTerminated { .. } => "vm_terminated",
        }
    }

    pub fn to_payload(&self) -> Result<String, BusError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> Result<Self, BusError> {
        Ok(serde_json::from_str(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_carries_topic() {
        let ev = VmEvent::VmTerminated {
            vm_name: "vm-7".to_string(),
        };
        let payload = ev.to_payload().unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["topic"], "vm_terminated");
        assert_eq!(value["vm_name"], "vm-7");
    }

    #[test]
    fn test_health_check_msg_is_optional() {
        let ev = VmEvent::from_payload(
            r#"{"topic":"health_check","vm_name":"vm-1","vm_ip":"10.0.0.1","ok":false}"#,
        )
        .unwrap();
        assert_eq!(
            ev,
            VmEvent::HealthCheck {
                vm_name: "vm-1".to_string(),
                vm_ip: "10.0.0.1".to_string(),
                ok: false,
                msg: String::new(),
            }
        );
        assert_eq!(ev.name(), "health_check");
    }

    #[test]
    fn test_unknown_topic_is_rejected() {
        assert!(VmEvent::from_payload(r#"{"topic":"reboot","vm_name":"x"}"#).is_err());
    }
}
