use chrono::{DateTime, TimeZone, Utc};

use crate::bus::{BusError, BusResult, CoordinationStore, KeySpace};

const SERVER_START_TIMESTAMP: &str = "server_start_timestamp";

/// Process-wide record written once by the daemon and readable by anyone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub server_start: DateTime<Utc>,
}

impl ServerInfo {
    pub async fn record_start(
        store: &dyn CoordinationStore,
        keys: &KeySpace,
        now: DateTime<Utc>,
    ) -> BusResult<Self> {
        store
            .hash_set(
                &keys.server_info(),
                &[(SERVER_START_TIMESTAMP, now.timestamp().to_string())],
            )
            .await?;
        Ok(Self { server_start: now })
    }

    pub async fn load(store: &dyn CoordinationStore, keys: &KeySpace) -> BusResult<Option<Self>> {
        let key = keys.server_info();
        let Some(raw) = store.hash_get(&key, SERVER_START_TIMESTAMP).await? else {
            return Ok(None);
        };
        let secs: i64 = raw.parse().map_err(|_| BusError::Malformed {
            key: key.clone(),
            reason: format!("{} is not a unix timestamp: {}", SERVER_START_TIMESTAMP, raw),
        })?;
        let server_start = Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| BusError::Malformed {
                key,
                reason: format!("timestamp out of range: {}", secs),
            })?;
        Ok(Some(Self { server_start }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryStore;

    #[tokio::test]
    async fn test_start_timestamp_round_trips_through_store() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        assert!(ServerInfo::load(&store, &keys).await.unwrap().is_none());

        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        ServerInfo::record_start(&store, &keys, now).await.unwrap();

        let info = ServerInfo::load(&store, &keys).await.unwrap().unwrap();
        assert_eq!(info.server_start, now);
    }

    #[tokio::test]
    async fn test_garbage_timestamp_is_malformed() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        store
            .hash_set(&keys.server_info(), &[(SERVER_START_TIMESTAMP, "yesterday".into())])
            .await
            .unwrap();
        assert!(matches!(
            ServerInfo::load(&store, &keys).await,
            Err(BusError::Malformed { .. })
        ));
    }
}
