use std::collections::HashMap;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, EventType, GetOptions, Txn, TxnOp, WatchOptions,
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::bus::{BusResult, CoordinationStore, Subscription};
use crate::config::BusConfig;

const SUBSCRIPTION_BUFFER: usize = 256;

/// Coordination store backed by etcd.
///
/// Layout: a set member or hash field is the key `{key}/{member}`; its value is
/// the member itself or the field value. Publishing writes `{topic}/{uuid}` and
/// deletes it right away; subscribers watch the `{topic}/` prefix and see the
/// put event, so nothing accumulates in the store.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

fn entry_key(key: &str, member: &str) -> String {
    format!("{}/{}", key, member)
}

fn entry_prefix(key: &str) -> String {
    format!("{}/", key)
}

impl EtcdStore {
    pub async fn connect(config: &BusConfig) -> BusResult<Self> {
        let client = Client::connect(&config.endpoints, None).await?;
        tracing::info!(endpoints = ?config.endpoints, "Connected to etcd");
        Ok(Self { client })
    }

    fn client(&self) -> Client {
        self.client.clone()
    }

    async fn entries(&self, key: &str) -> BusResult<Vec<(String, String)>> {
        let prefix = entry_prefix(key);
        let resp = self
            .client()
            .get(prefix.clone(), Some(GetOptions::new().with_prefix()))
            .await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).replacen(&prefix, "", 1),
                    String::from_utf8_lossy(kv.value()).to_string(),
                )
            })
            .collect())
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn ping(&self) -> BusResult<()> {
        self.client().status().await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> BusResult<()> {
        let key = entry_key(topic, &Uuid::new_v4().to_string());
        let mut client = self.client();
        client.put(key.clone(), payload, None).await?;
        client.delete(key, None).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> BusResult<Subscription> {
        let prefix = entry_prefix(topic);
        let (watcher, mut stream) = self
            .client()
            .watch(prefix.clone(), Some(WatchOptions::new().with_prefix()))
            .await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        tokio::spawn(async move {
            // Dropping the watcher at the end of this task cancels the watch.
            let _watcher = watcher;
            loop {
                let resp = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(topic = %prefix, error = %e, "Watch stream failed");
                        break;
                    }
                };
                for event in resp.events() {
                    if event.event_type() != EventType::Put {
                        continue;
                    }
                    let Some(kv) = event.kv() else { continue };
                    let payload = String::from_utf8_lossy(kv.value()).to_string();
                    if tx.send(payload).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn set_add(&self, key: &str, member: &str) -> BusResult<bool> {
        let entry = entry_key(key, member);
        let txn = Txn::new()
            .when([Compare::version(entry.clone(), CompareOp::Equal, 0)])
            .and_then([TxnOp::put(entry, member, None)]);
        Ok(self.client().txn(txn).await?.succeeded())
    }

    async fn set_remove(&self, key: &str, member: &str) -> BusResult<bool> {
        let resp = self.client().delete(entry_key(key, member), None).await?;
        Ok(resp.deleted() > 0)
    }

    async fn set_members(&self, key: &str) -> BusResult<Vec<String>> {
        Ok(self
            .entries(key)
            .await?
            .into_iter()
            .map(|(_, member)| member)
            .collect())
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> BusResult<()> {
        let ops: Vec<TxnOp> = fields
            .iter()
            .map(|(field, value)| TxnOp::put(entry_key(key, field), value.as_str(), None))
            .collect();
        self.client().txn(Txn::new().and_then(ops)).await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> BusResult<Option<String>> {
        let resp = self.client().get(entry_key(key, field), None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| String::from_utf8_lossy(kv.value()).to_string()))
    }

    async fn hash_get_all(&self, key: &str) -> BusResult<HashMap<String, String>> {
        Ok(self.entries(key).await?.into_iter().collect())
    }

    async fn delete(&self, key: &str) -> BusResult<()> {
        self.client()
            .delete(entry_prefix(key), Some(DeleteOptions::new().with_prefix()))
            .await?;
        Ok(())
    }
}

