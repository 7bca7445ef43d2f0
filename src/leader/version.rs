//! Rolling-upgrade watermark: the highest config version any node has seen
//!
//! A node whose own version is below the watermark is outdated and must not
//! lead. The first node of a new version raises the watermark.

use crate::error::StoreError;
use crate::store::{optimistic, Attempt, RetryPolicy, SharedStore};
use parking_lot::Mutex;
use tracing::info;

/// A value together with the version token needed to replace it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

pub trait VersionWatermark: Send + Sync {
    /// Current watermark. `None` until some node has written one.
    fn read(&self) -> Result<Option<Versioned<u64>>, StoreError>;

    /// Store `new` only if the watermark's version token is still `expected`
    /// (0 when it has never been written)
    fn compare_and_set(&self, expected: u64, new: u64) -> Result<bool, StoreError>;
}

/// Read the watermark, raise it to `mine` if it is lower, and report whether
/// `mine` is the latest version
pub fn check_latest_version(
    watermark: &dyn VersionWatermark,
    mine: u64,
    policy: &RetryPolicy,
) -> Result<bool, StoreError> {
    optimistic(policy, "version", || {
        let current = watermark.read()?;
        match current {
            Some(current) if current.value > mine => Ok(Attempt::Done(false)),
            Some(current) if current.value == mine => Ok(Attempt::Done(true)),
            _ => {
                let expected = current.map(|c| c.version).unwrap_or(0);
                if watermark.compare_and_set(expected, mine)? {
                    info!(
                        previous = ?current.map(|c| c.value),
                        version = mine,
                        "Raised config version watermark"
                    );
                    Ok(Attempt::Done(true))
                } else {
                    Ok(Attempt::Conflict)
                }
            }
        }
    })
}

#[derive(Default)]
pub struct MemoryVersionWatermark {
    current: Mutex<Option<Versioned<u64>>>,
}

impl MemoryVersionWatermark {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VersionWatermark for MemoryVersionWatermark {
    fn read(&self) -> Result<Option<Versioned<u64>>, StoreError> {
        Ok(*self.current.lock())
    }

    fn compare_and_set(&self, expected: u64, new: u64) -> Result<bool, StoreError> {
        let mut current = self.current.lock();
        let version = current.map(|c| c.version).unwrap_or(0);
        if version != expected {
            return Ok(false);
        }
        *current = Some(Versioned {
            value: new,
            version: version + 1,
        });
        Ok(true)
    }
}

/// Watermark stored under `{realm}__version`
pub struct SharedVersionWatermark {
    store: SharedStore,
    key: String,
}

impl SharedVersionWatermark {
    pub fn new(store: SharedStore) -> Self {
        Self {
            key: store.key("version"),
            store,
        }
    }
}

impl VersionWatermark for SharedVersionWatermark {
    fn read(&self) -> Result<Option<Versioned<u64>>, StoreError> {
        self.store.read(|tx| {
            let value: Option<u64> = tx.get(&self.key)?;
            let version = tx.version(&self.key)?;
            Ok(value.map(|value| Versioned { value, version }))
        })
    }

    fn compare_and_set(&self, expected: u64, new: u64) -> Result<bool, StoreError> {
        self.store.atomically(|tx| {
            if tx.version(&self.key)? != expected {
                return Ok(false);
            }
            tx.set(&self.key, &new)?;
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn strategies() -> Vec<Arc<dyn VersionWatermark>> {
        let shared = SharedStore::open_in_memory("test").unwrap();
        vec![
            Arc::new(MemoryVersionWatermark::new()),
            Arc::new(SharedVersionWatermark::new(shared)),
        ]
    }

    #[test]
    fn test_compare_and_set_uses_version_token() {
        for watermark in strategies() {
            assert_eq!(watermark.read().unwrap(), None);
            assert!(watermark.compare_and_set(0, 1).unwrap());

            let current = watermark.read().unwrap().unwrap();
            assert_eq!(current.value, 1);
            // stale token
            assert!(!watermark.compare_and_set(0, 2).unwrap());
            assert!(watermark.compare_and_set(current.version, 2).unwrap());
            assert_eq!(watermark.read().unwrap().unwrap().value, 2);
        }
    }

    #[test]
    fn test_first_node_sets_watermark() {
        for watermark in strategies() {
            let policy = RetryPolicy::default();
            assert!(check_latest_version(watermark.as_ref(), 3, &policy).unwrap());
            assert_eq!(watermark.read().unwrap().unwrap().value, 3);
        }
    }

    #[test]
    fn test_older_node_is_not_latest() {
        for watermark in strategies() {
            let policy = RetryPolicy::default();
            assert!(check_latest_version(watermark.as_ref(), 2, &policy).unwrap());
            assert!(check_latest_version(watermark.as_ref(), 3, &policy).unwrap());

            assert!(!check_latest_version(watermark.as_ref(), 2, &policy).unwrap());
            assert!(check_latest_version(watermark.as_ref(), 3, &policy).unwrap());
            // never lowered
            assert_eq!(watermark.read().unwrap().unwrap().value, 3);
        }
    }
}
