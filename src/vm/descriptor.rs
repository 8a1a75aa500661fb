use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::bus::BusError;
use crate::vm::state::VmState;

/// Coordination record for one build VM, stored as a hash on the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmDescriptor {
    pub vm_name: String,
    pub group_id: u32,
    pub vm_ip: String,
    pub state: VmState,
    /// Consecutive failed health checks.
    pub check_fails: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub spawn_time: DateTime<Utc>,
    pub termination_requested_at: Option<DateTime<Utc>>,
    /// Worker holding the VM while it is `InUse`.
    pub bound_to: Option<String>,
    pub task_id: Option<String>,
    pub in_use_since: Option<DateTime<Utc>>,
    /// Last time a worker handed the VM back after a build.
    pub released_at: Option<DateTime<Utc>>,
}

impl VmDescriptor {
    /// Descriptor of a VM that has just received its address.
    pub fn new(vm_name: &str, vm_ip: &str, group_id: u32, now: DateTime<Utc>) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            group_id,
            vm_ip: vm_ip.to_string(),
            state: VmState::GotIp,
            check_fails: 0,
            last_health_check: None,
            last_success: None,
            spawn_time: now,
            termination_requested_at: None,
            bound_to: None,
            task_id: None,
            in_use_since: None,
            released_at: None,
        }
    }

    /// Reference point of the liveness watchdog: the latest sign of life, a
    /// successful check or a finished build, falling back to the spawn time.
    pub fn watchdog_since(&self) -> DateTime<Utc> {
        [self.last_success, self.released_at]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.spawn_time)
    }

    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("vm_name", self.vm_name.clone()),
            ("group_id", self.group_id.to_string()),
            ("vm_ip", self.vm_ip.clone()),
            ("state", self.state.as_str().to_string()),
            ("check_fails", self.check_fails.to_string()),
            ("last_health_check", encode_time(self.last_health_check)),
            ("last_success", encode_time(self.last_success)),
            ("spawn_time", self.spawn_time.timestamp_millis().to_string()),
            (
                "termination_requested_at",
                encode_time(self.termination_requested_at),
            ),
            ("bound_to", self.bound_to.clone().unwrap_or_default()),
            ("task_id", self.task_id.clone().unwrap_or_default()),
            ("in_use_since", encode_time(self.in_use_since)),
            ("released_at", encode_time(self.released_at)),
        ]
    }

    pub fn from_fields(key: &str, fields: &HashMap<String, String>) -> Result<Self, BusError> {
        let field = |name: &str| -> Result<&str, BusError> {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| malformed(key, format!("missing field {}", name)))
        };
        let optional = |name: &str| -> Option<String> {
            fields.get(name).filter(|v| !v.is_empty()).cloned()
        };

        let state = field("state")?
            .parse::<VmState>()
            .map_err(|e| malformed(key, e.to_string()))?;
        let group_id = field("group_id")?
            .parse()
            .map_err(|_| malformed(key, "group_id is not a number".to_string()))?;
        let check_fails = field("check_fails")?
            .parse()
            .map_err(|_| malformed(key, "check_fails is not a number".to_string()))?;
        let spawn_time = decode_time(key, field("spawn_time")?)?
            .ok_or_else(|| malformed(key, "spawn_time is empty".to_string()))?;

        Ok(Self {
            vm_name: field("vm_name")?.to_string(),
            group_id,
            vm_ip: field("vm_ip")?.to_string(),
            state,
            check_fails,
            last_health_check: decode_time(key, field("last_health_check").unwrap_or(""))?,
            last_success: decode_time(key, field("last_success").unwrap_or(""))?,
            spawn_time,
            termination_requested_at: decode_time(
                key,
                field("termination_requested_at").unwrap_or(""),
            )?,
            bound_to: optional("bound_to"),
            task_id: optional("task_id"),
            in_use_since: decode_time(key, field("in_use_since").unwrap_or(""))?,
            released_at: decode_time(key, field("released_at").unwrap_or(""))?,
        })
    }
}

fn malformed(key: &str, reason: String) -> BusError {
    BusError::Malformed {
        key: key.to_string(),
        reason,
    }
}

pub(crate) fn encode_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.timestamp_millis().to_string())
        .unwrap_or_default()
}

pub(crate) fn decode_time(key: &str, raw: &str) -> Result<Option<DateTime<Utc>>, BusError> {
    if raw.is_empty() {
        return Ok(None);
    }
    let millis: i64 = raw
        .parse()
        .map_err(|_| malformed(key, format!("bad timestamp {}", raw)))?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(Some)
        .ok_or_else(|| malformed(key, format!("timestamp out of range {}", millis)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_map(desc: &VmDescriptor) -> HashMap<String, String> {
        desc.to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn test_fresh_descriptor_decodes_with_empty_optionals() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let desc = VmDescriptor::new("vm-1", "10.0.0.1", 2, now);

        let decoded = VmDescriptor::from_fields("k", &as_map(&desc)).unwrap();
        assert_eq!(decoded, desc);
        assert_eq!(decoded.watchdog_since(), now);
        assert!(decoded.bound_to.is_none());
    }

    #[test]
    fn test_watchdog_since_takes_latest_sign_of_life() {
        let spawn = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let mut desc = VmDescriptor::new("vm-1", "10.0.0.1", 0, spawn);
        desc.last_success = Some(spawn + chrono::Duration::seconds(10));
        assert_eq!(desc.watchdog_since(), spawn + chrono::Duration::seconds(10));

        desc.released_at = Some(spawn + chrono::Duration::seconds(900));
        assert_eq!(desc.watchdog_since(), spawn + chrono::Duration::seconds(900));
    }

    #[test]
    fn test_records_without_checkout_fields_still_decode() {
        let desc = VmDescriptor::new("vm-1", "10.0.0.1", 0, Utc::now());
        let mut map = as_map(&desc);
        map.remove("in_use_since");
        map.remove("released_at");

        let decoded = VmDescriptor::from_fields("k", &map).unwrap();
        assert!(decoded.in_use_since.is_none());
        assert!(decoded.released_at.is_none());
    }

    #[test]
    fn test_missing_state_is_malformed() {
        let now = Utc::now();
        let mut map = as_map(&VmDescriptor::new("vm-1", "10.0.0.1", 0, now));
        map.remove("state");
        assert!(matches!(
            VmDescriptor::from_fields("k", &map),
            Err(BusError::Malformed { .. })
        ));
    }

    #[test]
    fn test_unknown_state_is_malformed() {
        let mut map = as_map(&VmDescriptor::new("vm-1", "10.0.0.1", 0, Utc::now()));
        map.insert("state".to_string(), "melted".to_string());
        assert!(VmDescriptor::from_fields("k", &map).is_err());
    }
}
