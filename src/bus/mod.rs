//! Coordination medium shared by every backend process.
//!
//! The daemon, the VM manager and each worker run as separate OS processes
//! and never share memory. Everything they agree on lives behind the
//! [`CoordinationStore`] trait:
//!
//! - **Topics**: fire-and-forget publish/subscribe. Delivery is at most once
//!   per subscriber and unordered across topics.
//! - **Sets**: membership with atomic add/remove. `set_remove` tells the caller
//!   whether *its* call removed the member, which is what makes VM checkout and
//!   task claiming exclusive.
//! - **Hashes**: field maps for VM descriptors, pool metadata and server info.
//!
//! # Implementations
//!
//! - [`EtcdStore`]: production store, one etcd key per set member / hash field.
//! - [`MemoryStore`]: in-process store for deterministic tests.

pub mod etcd;
pub mod events;
pub mod keys;
pub mod memory;
pub mod server_info;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub use etcd::EtcdStore;
pub use events::VmEvent;
pub use keys::KeySpace;
pub use memory::MemoryStore;
pub use server_info::ServerInfo;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("etcd: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("malformed payload on {key}: {reason}")]
    Malformed { key: String, reason: String },

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type BusResult<T> = std::result::Result<T, BusError>;

/// Stream of raw payloads published on one topic.
pub type Subscription = BoxStream<'static, String>;

/// Shared handle used by all components.
pub type SharedStore = Arc<dyn CoordinationStore>;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Cheap round trip used to check the store is reachable.
    async fn ping(&self) -> BusResult<()>;

    async fn publish(&self, topic: &str, payload: &str) -> BusResult<()>;

    /// Messages published after this call returns are delivered to the stream.
    async fn subscribe(&self, topic: &str) -> BusResult<Subscription>;

    /// Returns true when the member was not present before.
    async fn set_add(&self, key: &str, member: &str) -> BusResult<bool>;

    /// Returns true only for the single caller that actually removed the member.
    async fn set_remove(&self, key: &str, member: &str) -> BusResult<bool>;

    async fn set_members(&self, key: &str) -> BusResult<Vec<String>>;

    /// Writes all fields in one atomic step.
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> BusResult<()>;

    async fn hash_get(&self, key: &str, field: &str) -> BusResult<Option<String>>;

    async fn hash_get_all(&self, key: &str) -> BusResult<HashMap<String, String>>;

    /// Removes a whole set or hash.
    async fn delete(&self, key: &str) -> BusResult<()>;
}
