//! Proxy records, keyed by proxy id

use crate::error::ProxyError;
use crate::model::{ProxyRecord, ProxyStatus};
use crate::store::SharedStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

pub trait ProxyStore: Send + Sync {
    fn add(&self, proxy: ProxyRecord) -> Result<(), ProxyError>;

    /// Replace an existing record
    fn update(&self, proxy: ProxyRecord) -> Result<(), ProxyError>;

    fn get(&self, proxy_id: &str) -> Result<Option<ProxyRecord>, ProxyError>;

    fn remove(&self, proxy_id: &str) -> Result<Option<ProxyRecord>, ProxyError>;

    fn all(&self) -> Result<Vec<ProxyRecord>, ProxyError>;

    /// Atomically move a proxy to `next`, returning the updated record
    fn transition(&self, proxy_id: &str, next: ProxyStatus) -> Result<ProxyRecord, ProxyError>;

    /// Replace the record only while its stored status is still `expected`.
    /// Returns false, writing nothing, if it moved on or was removed.
    fn replace_if_status(&self, proxy: ProxyRecord, expected: ProxyStatus) -> Result<bool, ProxyError>;
}

#[derive(Default)]
pub struct MemoryProxyStore {
    proxies: DashMap<String, ProxyRecord>,
}

impl MemoryProxyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProxyStore for MemoryProxyStore {
    fn add(&self, proxy: ProxyRecord) -> Result<(), ProxyError> {
        match self.proxies.entry(proxy.id.clone()) {
            Entry::Occupied(entry) => Err(ProxyError::Duplicate(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(proxy);
                Ok(())
            }
        }
    }

    fn update(&self, proxy: ProxyRecord) -> Result<(), ProxyError> {
        match self.proxies.get_mut(&proxy.id) {
            Some(mut existing) => {
                *existing = proxy;
                Ok(())
            }
            None => Err(ProxyError::NotFound(proxy.id)),
        }
    }

    fn get(&self, proxy_id: &str) -> Result<Option<ProxyRecord>, ProxyError> {
        Ok(self.proxies.get(proxy_id).map(|p| p.clone()))
    }

    fn remove(&self, proxy_id: &str) -> Result<Option<ProxyRecord>, ProxyError> {
        Ok(self.proxies.remove(proxy_id).map(|(_, p)| p))
    }

    fn all(&self) -> Result<Vec<ProxyRecord>, ProxyError> {
        Ok(self.proxies.iter().map(|p| p.value().clone()).collect())
    }

    fn transition(&self, proxy_id: &str, next: ProxyStatus) -> Result<ProxyRecord, ProxyError> {
        let mut proxy = self
            .proxies
            .get_mut(proxy_id)
            .ok_or_else(|| ProxyError::NotFound(proxy_id.to_string()))?;
        proxy.transition(next)?;
        Ok(proxy.clone())
    }

    fn replace_if_status(&self, proxy: ProxyRecord, expected: ProxyStatus) -> Result<bool, ProxyError> {
        match self.proxies.get_mut(&proxy.id) {
            Some(mut existing) if existing.status == expected => {
                *existing = proxy;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Records in the hash `{realm}__proxies`
pub struct SharedProxyStore {
    store: SharedStore,
    key: String,
}

impl SharedProxyStore {
    pub fn new(store: SharedStore) -> Self {
        Self {
            key: store.key("proxies"),
            store,
        }
    }
}

impl ProxyStore for SharedProxyStore {
    fn add(&self, proxy: ProxyRecord) -> Result<(), ProxyError> {
        self.store.atomically(|tx| {
            if tx.hget::<ProxyRecord>(&self.key, &proxy.id)?.is_some() {
                return Err(ProxyError::Duplicate(proxy.id.clone()));
            }
            tx.hset(&self.key, &proxy.id, &proxy)?;
            Ok(())
        })
    }

    fn update(&self, proxy: ProxyRecord) -> Result<(), ProxyError> {
        self.store.atomically(|tx| {
            if tx.hget::<ProxyRecord>(&self.key, &proxy.id)?.is_none() {
                return Err(ProxyError::NotFound(proxy.id.clone()));
            }
            tx.hset(&self.key, &proxy.id, &proxy)?;
            Ok(())
        })
    }

    fn get(&self, proxy_id: &str) -> Result<Option<ProxyRecord>, ProxyError> {
        Ok(self.store.read(|tx| tx.hget(&self.key, proxy_id))?)
    }

    fn remove(&self, proxy_id: &str) -> Result<Option<ProxyRecord>, ProxyError> {
        self.store.atomically(|tx| {
            let existing = tx.hget::<ProxyRecord>(&self.key, proxy_id)?;
            if existing.is_some() {
                tx.hdel(&self.key, proxy_id)?;
            }
            Ok(existing)
        })
    }

    fn all(&self) -> Result<Vec<ProxyRecord>, ProxyError> {
        let entries = self.store.read(|tx| tx.hgetall::<ProxyRecord>(&self.key))?;
        Ok(entries.into_iter().map(|(_, p)| p).collect())
    }

    fn transition(&self, proxy_id: &str, next: ProxyStatus) -> Result<ProxyRecord, ProxyError> {
        self.store.atomically(|tx| {
            let mut proxy = tx
                .hget::<ProxyRecord>(&self.key, proxy_id)?
                .ok_or_else(|| ProxyError::NotFound(proxy_id.to_string()))?;
            proxy.transition(next)?;
            tx.hset(&self.key, proxy_id, &proxy)?;
            Ok(proxy)
        })
    }

    fn replace_if_status(&self, proxy: ProxyRecord, expected: ProxyStatus) -> Result<bool, ProxyError> {
        self.store.atomically(|tx| {
            match tx.hget::<ProxyRecord>(&self.key, &proxy.id)? {
                Some(current) if current.status == expected => {
                    tx.hset(&self.key, &proxy.id, &proxy)?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }
}
