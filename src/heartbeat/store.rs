//! Last-seen timestamps per proxy

use crate::error::StoreError;
use crate::store::SharedStore;
use dashmap::DashMap;

/// Last-write-wins map of proxy id → epoch millis of the latest liveness signal
pub trait HeartbeatStore: Send + Sync {
    fn update(&self, proxy_id: &str, millis: i64) -> Result<(), StoreError>;

    fn get(&self, proxy_id: &str) -> Result<Option<i64>, StoreError>;

    fn remove(&self, proxy_id: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryHeartbeatStore {
    beats: DashMap<String, i64>,
}

impl MemoryHeartbeatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HeartbeatStore for MemoryHeartbeatStore {
    fn update(&self, proxy_id: &str, millis: i64) -> Result<(), StoreError> {
        self.beats.insert(proxy_id.to_string(), millis);
        Ok(())
    }

    fn get(&self, proxy_id: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.beats.get(proxy_id).map(|v| *v))
    }

    fn remove(&self, proxy_id: &str) -> Result<(), StoreError> {
        self.beats.remove(proxy_id);
        Ok(())
    }
}

/// Heartbeats in the hash `{realm}__heartbeats`
pub struct SharedHeartbeatStore {
    store: SharedStore,
    key: String,
}

impl SharedHeartbeatStore {
    pub fn new(store: SharedStore) -> Self {
        Self {
            key: store.key("heartbeats"),
            store,
        }
    }
}

impl HeartbeatStore for SharedHeartbeatStore {
    fn update(&self, proxy_id: &str, millis: i64) -> Result<(), StoreError> {
        self.store
            .atomically(|tx| tx.hset(&self.key, proxy_id, &millis))
    }

    fn get(&self, proxy_id: &str) -> Result<Option<i64>, StoreError> {
        self.store.read(|tx| tx.hget(&self.key, proxy_id))
    }

    fn remove(&self, proxy_id: &str) -> Result<(), StoreError> {
        self.store
            .atomically(|tx| tx.hdel(&self.key, proxy_id).map(|_| ()))
    }
}
