//! Cluster-wide lease used for leader election

use crate::error::StoreError;
use crate::store::SharedStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Current lease on the leader lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    /// Epoch millis after which the lease is free for anyone
    pub expires_at: i64,
}

impl Lease {
    fn is_live(&self, now: i64) -> bool {
        now < self.expires_at
    }
}

pub trait LeaseLock: Send + Sync {
    /// Take the lock, or extend it when `holder` already has it.
    /// Returns false while someone else holds a live lease.
    fn try_acquire(&self, holder: &str, now: i64, lease: Duration) -> Result<bool, StoreError>;

    /// Give up the lock if `holder` has it
    fn release(&self, holder: &str) -> Result<bool, StoreError>;

    /// Holder of the live lease, if any
    fn holder(&self, now: i64) -> Result<Option<String>, StoreError>;
}

fn next_lease(current: Option<&Lease>, holder: &str, now: i64, lease: Duration) -> Option<Lease> {
    match current {
        Some(existing) if existing.is_live(now) && existing.holder != holder => None,
        _ => Some(Lease {
            holder: holder.to_string(),
            expires_at: now + lease.as_millis() as i64,
        }),
    }
}

#[derive(Default)]
pub struct MemoryLeaseLock {
    lease: Mutex<Option<Lease>>,
}

impl MemoryLeaseLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseLock for MemoryLeaseLock {
    fn try_acquire(&self, holder: &str, now: i64, lease: Duration) -> Result<bool, StoreError> {
        let mut current = self.lease.lock();
        match next_lease(current.as_ref(), holder, now, lease) {
            Some(next) => {
                *current = Some(next);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn release(&self, holder: &str) -> Result<bool, StoreError> {
        let mut current = self.lease.lock();
        if current.as_ref().is_some_and(|l| l.holder == holder) {
            *current = None;
            return Ok(true);
        }
        Ok(false)
    }

    fn holder(&self, now: i64) -> Result<Option<String>, StoreError> {
        Ok(self
            .lease
            .lock()
            .as_ref()
            .filter(|l| l.is_live(now))
            .map(|l| l.holder.clone()))
    }
}

/// Lease stored under `{realm}__leader_lock`
pub struct SharedLeaseLock {
    store: SharedStore,
    key: String,
}

impl SharedLeaseLock {
    pub fn new(store: SharedStore) -> Self {
        Self {
            key: store.key("leader_lock"),
            store,
        }
    }
}

impl LeaseLock for SharedLeaseLock {
    fn try_acquire(&self, holder: &str, now: i64, lease: Duration) -> Result<bool, StoreError> {
        self.store.atomically(|tx| {
            let current: Option<Lease> = tx.get(&self.key)?;
            match next_lease(current.as_ref(), holder, now, lease) {
                Some(next) => {
                    tx.set(&self.key, &next)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn release(&self, holder: &str) -> Result<bool, StoreError> {
        self.store.atomically(|tx| {
            let current: Option<Lease> = tx.get(&self.key)?;
            if current.is_some_and(|l| l.holder == holder) {
                return tx.del(&self.key);
            }
            Ok(false)
        })
    }

    fn holder(&self, now: i64) -> Result<Option<String>, StoreError> {
        let current: Option<Lease> = self.store.read(|tx| tx.get(&self.key))?;
        Ok(current.filter(|l| l.is_live(now)).map(|l| l.holder))
    }
}
