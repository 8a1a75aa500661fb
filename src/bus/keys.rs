/// Names of every key and topic the backend uses, under one namespace prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("buildfarm:backend:")
    }
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Set of VM names available for checkout in `group_id`.
    pub fn vm_pool(&self, group_id: u32) -> String {
        format!("{}vm_pool:set::{}", self.prefix, group_id)
    }

    /// Hash with pool metadata, field `last_vm_spawn_start`.
    pub fn vm_pool_info(&self, group_id: u32) -> String {
        format!("{}vm_pool_info:hset::{}", self.prefix, group_id)
    }

    pub fn vm_instance(&self, vm_name: &str) -> String {
        format!("{}vm_instance:hset::{}", self.prefix, vm_name)
    }

    /// Set of every VM name the manager knows about, in any state.
    pub fn vm_index(&self) -> String {
        format!("{}vm_index:set::", self.prefix)
    }

    pub fn server_info(&self) -> String {
        format!("{}server_info:hset::", self.prefix)
    }

    pub fn vm_events(&self) -> String {
        format!("{}vm:pubsub::", self.prefix)
    }

    /// Per-VM topic carrying build cancellation requests.
    pub fn interrupt_topic(&self, vm_ip: &str) -> String {
        format!("{}interrupt_build:pubsub::{}", self.prefix, vm_ip)
    }

    pub fn task_queue(&self, group_id: u32) -> String {
        format!("{}task_queue:set::{}", self.prefix, group_id)
    }

    pub fn task(&self, task_id: &str) -> String {
        format!("{}task:hset::{}", self.prefix, task_id)
    }

    pub fn task_known(&self) -> String {
        format!("{}task_known:set::", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_share_prefix() {
        let keys = KeySpace::new("copr:test:");
        assert_eq!(keys.vm_pool(3), "copr:test:vm_pool:set::3");
        assert_eq!(keys.vm_pool_info(3), "copr:test:vm_pool_info:hset::3");
        assert_eq!(keys.vm_instance("vm-1"), "copr:test:vm_instance:hset::vm-1");
        assert_eq!(keys.server_info(), "copr:test:server_info:hset::");
        assert_eq!(
            keys.interrupt_topic("10.0.0.5"),
            "copr:test:interrupt_build:pubsub::10.0.0.5"
        );
    }

    #[test]
    fn test_different_namespaces_do_not_collide() {
        let a = KeySpace::new("a:");
        let b = KeySpace::new("b:");
        assert_ne!(a.vm_pool(0), b.vm_pool(0));
        assert_ne!(a.vm_events(), b.vm_events());
    }
}
