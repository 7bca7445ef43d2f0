//! Directory of delegate proxies: the pooled containers seats are carved from

use crate::error::DelegateError;
use crate::model::DelegateProxy;
use crate::store::SharedStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Delegate proxies of one pool (spec id)
pub trait DelegateProxyStore: Send + Sync {
    fn pool_id(&self) -> &str;

    fn add(&self, delegate: DelegateProxy) -> Result<(), DelegateError>;

    /// Remove a delegate, returning whether it existed
    fn remove(&self, delegate_id: &str) -> Result<bool, DelegateError>;

    /// Replace the whole record
    fn update(&self, delegate: DelegateProxy) -> Result<(), DelegateError>;

    fn get(&self, delegate_id: &str) -> Result<Option<DelegateProxy>, DelegateError>;

    fn all(&self) -> Result<Vec<DelegateProxy>, DelegateError>;

    /// Forget seats that no longer exist, returning the updated record
    fn remove_seat_ids(
        &self,
        delegate_id: &str,
        seat_ids: &[String],
    ) -> Result<DelegateProxy, DelegateError>;
}

#[derive(Default)]
pub struct MemoryDelegateProxyStore {
    pool_id: String,
    delegates: DashMap<String, DelegateProxy>,
}

impl MemoryDelegateProxyStore {
    pub fn new(pool_id: &str) -> Self {
        Self {
            pool_id: pool_id.to_string(),
            delegates: DashMap::new(),
        }
    }
}

impl DelegateProxyStore for MemoryDelegateProxyStore {
    fn pool_id(&self) -> &str {
        &self.pool_id
    }

    fn add(&self, delegate: DelegateProxy) -> Result<(), DelegateError> {
        match self.delegates.entry(delegate.id().to_string()) {
            Entry::Occupied(entry) => Err(DelegateError::Duplicate(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(delegate);
                Ok(())
            }
        }
    }

    fn remove(&self, delegate_id: &str) -> Result<bool, DelegateError> {
        Ok(self.delegates.remove(delegate_id).is_some())
    }

    fn update(&self, delegate: DelegateProxy) -> Result<(), DelegateError> {
        match self.delegates.get_mut(delegate.id()) {
            Some(mut existing) => {
                *existing = delegate;
                Ok(())
            }
            None => Err(DelegateError::Unknown(delegate.id().to_string())),
        }
    }

    fn get(&self, delegate_id: &str) -> Result<Option<DelegateProxy>, DelegateError> {
        Ok(self.delegates.get(delegate_id).map(|d| d.clone()))
    }

    fn all(&self) -> Result<Vec<DelegateProxy>, DelegateError> {
        Ok(self.delegates.iter().map(|d| d.value().clone()).collect())
    }

    fn remove_seat_ids(
        &self,
        delegate_id: &str,
        seat_ids: &[String],
    ) -> Result<DelegateProxy, DelegateError> {
        let mut delegate = self
            .delegates
            .get_mut(delegate_id)
            .ok_or_else(|| DelegateError::Unknown(delegate_id.to_string()))?;
        for id in seat_ids {
            delegate.seat_ids.remove(id);
        }
        Ok(delegate.clone())
    }
}

/// Delegates in the hash `{realm}__delegate_proxies_{pool}`
pub struct SharedDelegateProxyStore {
    store: SharedStore,
    pool_id: String,
    key: String,
}

impl SharedDelegateProxyStore {
    pub fn new(store: SharedStore, pool_id: &str) -> Self {
        Self {
            key: store.key(&format!("delegate_proxies_{}", pool_id)),
            pool_id: pool_id.to_string(),
            store,
        }
    }
}

impl DelegateProxyStore for SharedDelegateProxyStore {
    fn pool_id(&self) -> &str {
        &self.pool_id
    }

    fn add(&self, delegate: DelegateProxy) -> Result<(), DelegateError> {
        self.store.atomically(|tx| {
            if tx.hget::<DelegateProxy>(&self.key, delegate.id())?.is_some() {
                return Err(DelegateError::Duplicate(delegate.id().to_string()));
            }
            tx.hset(&self.key, delegate.id(), &delegate)?;
            Ok(())
        })
    }

    fn remove(&self, delegate_id: &str) -> Result<bool, DelegateError> {
        Ok(self.store.atomically(|tx| tx.hdel(&self.key, delegate_id))?)
    }

    fn update(&self, delegate: DelegateProxy) -> Result<(), DelegateError> {
        self.store.atomically(|tx| {
            if tx.hget::<DelegateProxy>(&self.key, delegate.id())?.is_none() {
                return Err(DelegateError::Unknown(delegate.id().to_string()));
            }
            tx.hset(&self.key, delegate.id(), &delegate)?;
            Ok(())
        })
    }

    fn get(&self, delegate_id: &str) -> Result<Option<DelegateProxy>, DelegateError> {
        Ok(self.store.read(|tx| tx.hget(&self.key, delegate_id))?)
    }

    fn all(&self) -> Result<Vec<DelegateProxy>, DelegateError> {
        let entries = self
            .store
            .read(|tx| tx.hgetall::<DelegateProxy>(&self.key))?;
        Ok(entries.into_iter().map(|(_, d)| d).collect())
    }

    fn remove_seat_ids(
        &self,
        delegate_id: &str,
        seat_ids: &[String],
    ) -> Result<DelegateProxy, DelegateError> {
        self.store.atomically(|tx| {
            let mut delegate = tx
                .hget::<DelegateProxy>(&self.key, delegate_id)?
                .ok_or_else(|| DelegateError::Unknown(delegate_id.to_string()))?;
            for id in seat_ids {
                delegate.seat_ids.remove(id);
            }
            tx.hset(&self.key, delegate_id, &delegate)?;
            Ok(delegate)
        })
    }
}

/// Hands out one delegate directory per pool
pub struct DelegateStoreFactory {
    shared: Option<SharedStore>,
    stores: DashMap<String, Arc<dyn DelegateProxyStore>>,
}

impl DelegateStoreFactory {
    pub fn memory() -> Self {
        Self {
            shared: None,
            stores: DashMap::new(),
        }
    }

    pub fn shared(store: SharedStore) -> Self {
        Self {
            shared: Some(store),
            stores: DashMap::new(),
        }
    }

    pub fn for_pool(&self, pool_id: &str) -> Arc<dyn DelegateProxyStore> {
        self.stores
            .entry(pool_id.to_string())
            .or_insert_with(|| match &self.shared {
                Some(store) => Arc::new(SharedDelegateProxyStore::new(store.clone(), pool_id)),
                None => Arc::new(MemoryDelegateProxyStore::new(pool_id)),
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProxyRecord;

    fn strategies() -> Vec<Arc<dyn DelegateProxyStore>> {
        let shared = SharedStore::open_in_memory("test").unwrap();
        vec![
            Arc::new(MemoryDelegateProxyStore::new("app")),
            Arc::new(SharedDelegateProxyStore::new(shared, "app")),
        ]
    }

    fn delegate(seats: &[&str]) -> DelegateProxy {
        DelegateProxy {
            proxy: ProxyRecord::new("app", "pool", 0),
            seat_ids: seats.iter().map(|s| s.to_string()).collect(),
            spec_fingerprint: "abc".to_string(),
        }
    }

    #[test]
    fn test_add_get_remove() {
        for store in strategies() {
            let d = delegate(&["s1", "s2"]);
            let id = d.id().to_string();
            store.add(d.clone()).unwrap();

            assert_eq!(store.get(&id).unwrap(), Some(d));
            assert_eq!(store.all().unwrap().len(), 1);

            assert!(store.remove(&id).unwrap());
            assert!(!store.remove(&id).unwrap());
            assert!(store.get(&id).unwrap().is_none());
        }
    }

    #[test]
    fn test_add_duplicate_fails() {
        for store in strategies() {
            let d = delegate(&["s1"]);
            store.add(d.clone()).unwrap();
            assert!(matches!(store.add(d), Err(DelegateError::Duplicate(_))));
        }
    }

    #[test]
    fn test_update_replaces_whole_record() {
        for store in strategies() {
            let mut d = delegate(&["s1"]);
            store.add(d.clone()).unwrap();

            d.spec_fingerprint = "def".to_string();
            d.seat_ids.insert("s2".to_string());
            store.update(d.clone()).unwrap();

            let stored = store.get(d.id()).unwrap().unwrap();
            assert_eq!(stored.spec_fingerprint, "def");
            assert_eq!(stored.seat_ids.len(), 2);
        }
    }

    #[test]
    fn test_update_unknown_fails() {
        for store in strategies() {
            let err = store.update(delegate(&[])).unwrap_err();
            assert!(matches!(err, DelegateError::Unknown(_)));
        }
    }

    #[test]
    fn test_remove_seat_ids() {
        for store in strategies() {
            let d = delegate(&["s1", "s2", "s3"]);
            store.add(d.clone()).unwrap();

            let updated = store
                .remove_seat_ids(d.id(), &["s1".to_string(), "s3".to_string()])
                .unwrap();
            assert_eq!(updated.seat_ids.len(), 1);
            assert!(updated.seat_ids.contains("s2"));
            assert_eq!(store.get(d.id()).unwrap().unwrap().seat_ids.len(), 1);

            assert!(matches!(
                store.remove_seat_ids("ghost", &[]),
                Err(DelegateError::Unknown(_))
            ));
        }
    }
}
