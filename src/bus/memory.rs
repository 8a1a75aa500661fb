use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::bus::{BusError, BusResult, CoordinationStore, Subscription};

const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Tables {
    sets: HashMap<String, BTreeSet<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// Coordination store living in one process. Every operation takes a single
/// lock, so each one is atomic just like its networked counterpart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> BusResult<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| BusError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn sender(&self, topic: &str) -> BusResult<broadcast::Sender<String>> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| BusError::Unavailable("memory store lock poisoned".to_string()))?;
        Ok(topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone())
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn ping(&self) -> BusResult<()> {
        self.tables().map(|_| ())
    }

    async fn publish(&self, topic: &str, payload: &str) -> BusResult<()> {
        // No subscribers is not an error: the message is simply dropped.
        let _ = self.sender(topic)?.send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> BusResult<Subscription> {
        let rx = self.sender(topic)?.subscribe();
        Ok(BroadcastStream::new(rx)
            .filter_map(|msg| async move { msg.ok() })
            .boxed())
    }

    async fn set_add(&self, key: &str, member: &str) -> BusResult<bool> {
        let mut tables = self.tables()?;
        Ok(tables
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> BusResult<bool> {
        let mut tables = self.tables()?;
        let removed = match tables.sets.get_mut(key) {
            Some(set) => set.remove(member),
            None => false,
        };
        if tables.sets.get(key).is_some_and(|s| s.is_empty()) {
            tables.sets.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> BusResult<Vec<String>> {
        let tables = self.tables()?;
        Ok(tables
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> BusResult<()> {
        let mut tables = self.tables()?;
        let hash = tables.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.to_string(), value.clone());
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> BusResult<Option<String>> {
        let tables = self.tables()?;
        Ok(tables.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hash_get_all(&self, key: &str) -> BusResult<HashMap<String, String>> {
        let tables = self.tables()?;
        Ok(tables.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> BusResult<()> {
        let mut tables = self.tables()?;
        tables.sets.remove(key);
        tables.hashes.remove(key);
        Ok(())
    }
}
