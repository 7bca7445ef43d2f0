//! Port allocation for proxy containers
//!
//! Ports are handed out per owner (a proxy id). A port belongs to at most one
//! owner at a time, and the lowest free port in the requested range wins.

use crate::error::PortError;
use crate::store::{Plan, SharedStore, WriteOp};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

pub trait PortAllocator: Send + Sync {
    /// Reserve the lowest port in `[from, to]` that nobody owns
    fn allocate(&self, from: u16, to: u16, owner: &str) -> Result<u16, PortError>;

    /// Record a port that is already in use by `owner` (crash recovery)
    fn add_existing_port(&self, owner: &str, port: u16) -> Result<(), PortError>;

    /// Free every port held by `owner`
    fn release(&self, owner: &str) -> Result<(), PortError>;

    fn owned_ports(&self, owner: &str) -> Result<BTreeSet<u16>, PortError>;
}

fn lowest_free<'a>(
    from: u16,
    to: u16,
    owned: impl Iterator<Item = &'a BTreeSet<u16>>,
) -> Result<u16, PortError> {
    if from > to {
        return Err(PortError::InvalidRange { from, to });
    }
    let used: BTreeSet<u16> = owned.flat_map(|ports| ports.iter().copied()).collect();
    (from..=to)
        .find(|port| !used.contains(port))
        .ok_or(PortError::Exhausted { from, to })
}

fn owner_of<'a>(
    port: u16,
    owned: impl Iterator<Item = (&'a String, &'a BTreeSet<u16>)>,
) -> Option<&'a String> {
    owned
        .filter(|(_, ports)| ports.contains(&port))
        .map(|(owner, _)| owner)
        .next()
}

#[derive(Default)]
pub struct MemoryPortAllocator {
    owned: Mutex<HashMap<String, BTreeSet<u16>>>,
}

impl MemoryPortAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PortAllocator for MemoryPortAllocator {
    fn allocate(&self, from: u16, to: u16, owner: &str) -> Result<u16, PortError> {
        let mut owned = self.owned.lock();
        let port = lowest_free(from, to, owned.values())?;
        owned.entry(owner.to_string()).or_default().insert(port);
        debug!(owner, port, "Allocated port");
        Ok(port)
    }

    fn add_existing_port(&self, owner: &str, port: u16) -> Result<(), PortError> {
        let mut owned = self.owned.lock();
        if let Some(other) = owner_of(port, owned.iter()) {
            if other != owner {
                return Err(PortError::AlreadyOwned {
                    port,
                    owner: other.clone(),
                });
            }
        }
        owned.entry(owner.to_string()).or_default().insert(port);
        Ok(())
    }

    fn release(&self, owner: &str) -> Result<(), PortError> {
        if let Some(ports) = self.owned.lock().remove(owner) {
            debug!(owner, ?ports, "Released ports");
        }
        Ok(())
    }

    fn owned_ports(&self, owner: &str) -> Result<BTreeSet<u16>, PortError> {
        Ok(self.owned.lock().get(owner).cloned().unwrap_or_default())
    }
}

/// Ports in the hash `{realm}__ports`, owner → set of ports
pub struct SharedPortAllocator {
    store: SharedStore,
    key: String,
}

impl SharedPortAllocator {
    pub fn new(store: SharedStore) -> Self {
        Self {
            key: store.key("ports"),
            store,
        }
    }
}

impl PortAllocator for SharedPortAllocator {
    fn allocate(&self, from: u16, to: u16, owner: &str) -> Result<u16, PortError> {
        let port = self.store.transact(&[self.key.as_str()], |tx| -> Result<Plan<u16>, PortError> {
            let owned: HashMap<String, BTreeSet<u16>> =
                tx.hgetall::<BTreeSet<u16>>(&self.key)?.into_iter().collect();
            let port = lowest_free(from, to, owned.values())?;

            let mut mine = owned.get(owner).cloned().unwrap_or_default();
            mine.insert(port);
            Ok(Plan::write(port, vec![WriteOp::hset(&self.key, owner, &mine)?]))
        })?;
        debug!(owner, port, "Allocated port");
        Ok(port)
    }

    fn add_existing_port(&self, owner: &str, port: u16) -> Result<(), PortError> {
        self.store.transact(&[self.key.as_str()], |tx| -> Result<Plan<()>, PortError> {
            let owned: HashMap<String, BTreeSet<u16>> =
                tx.hgetall::<BTreeSet<u16>>(&self.key)?.into_iter().collect();
            if let Some(other) = owner_of(port, owned.iter()) {
                if other != owner {
                    return Err(PortError::AlreadyOwned {
                        port,
                        owner: other.clone(),
                    });
                }
                return Ok(Plan::done(()));
            }

            let mut mine = owned.get(owner).cloned().unwrap_or_default();
            mine.insert(port);
            Ok(Plan::write((), vec![WriteOp::hset(&self.key, owner, &mine)?]))
        })
    }

    fn release(&self, owner: &str) -> Result<(), PortError> {
        let removed = self
            .store
            .atomically(|tx| tx.hdel(&self.key, owner))?;
        if removed {
            debug!(owner, "Released ports");
        }
        Ok(())
    }

    fn owned_ports(&self, owner: &str) -> Result<BTreeSet<u16>, PortError> {
        let ports: Option<BTreeSet<u16>> = self
            .store
            .read(|tx| tx.hget::<BTreeSet<u16>>(&self.key, owner))?;
        Ok(ports.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn strategies() -> Vec<Arc<dyn PortAllocator>> {
        let shared = SharedStore::open_in_memory("test").unwrap();
        vec![
            Arc::new(MemoryPortAllocator::new()),
            Arc::new(SharedPortAllocator::new(shared)),
        ]
    }

    #[test]
    fn test_allocates_lowest_free_port() {
        for ports in strategies() {
            assert_eq!(ports.allocate(100, 110, "a").unwrap(), 100);
            assert_eq!(ports.allocate(100, 110, "b").unwrap(), 101);
            assert_eq!(ports.allocate(100, 110, "a").unwrap(), 102);
            assert_eq!(
                ports.owned_ports("a").unwrap(),
                BTreeSet::from([100, 102])
            );
        }
    }

    #[test]
    fn test_released_ports_are_reused() {
        for ports in strategies() {
            ports.allocate(100, 110, "a").unwrap();
            ports.allocate(100, 110, "b").unwrap();
            ports.release("a").unwrap();

            assert!(ports.owned_ports("a").unwrap().is_empty());
            assert_eq!(ports.allocate(100, 110, "c").unwrap(), 100);
        }
    }

    #[test]
    fn test_exhaustion() {
        for ports in strategies() {
            ports.allocate(100, 101, "a").unwrap();
            ports.allocate(100, 101, "b").unwrap();
            let err = ports.allocate(100, 101, "c").unwrap_err();
            assert!(matches!(err, PortError::Exhausted { from: 100, to: 101 }));
        }
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        for ports in strategies() {
            let err = ports.allocate(200, 100, "a").unwrap_err();
            assert!(matches!(err, PortError::InvalidRange { .. }));
        }
    }

    #[test]
    fn test_existing_port_is_respected() {
        for ports in strategies() {
            ports.add_existing_port("recovered", 100).unwrap();
            // idempotent for the same owner
            ports.add_existing_port("recovered", 100).unwrap();
            assert_eq!(ports.allocate(100, 110, "new").unwrap(), 101);

            let err = ports.add_existing_port("other", 100).unwrap_err();
            assert!(matches!(err, PortError::AlreadyOwned { port: 100, .. }));
        }
    }

    #[test]
    fn test_release_unknown_owner_is_noop() {
        for ports in strategies() {
            ports.release("nobody").unwrap();
        }
    }

    #[test]
    fn test_shared_allocators_see_each_other() {
        let shared = SharedStore::open_in_memory("test").unwrap();
        let a = SharedPortAllocator::new(shared.clone());
        let b = SharedPortAllocator::new(shared);

        assert_eq!(a.allocate(100, 110, "x").unwrap(), 100);
        assert_eq!(b.allocate(100, 110, "y").unwrap(), 101);
        assert_eq!(b.owned_ports("x").unwrap(), BTreeSet::from([100]));
    }
}
