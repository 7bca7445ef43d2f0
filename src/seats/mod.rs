//! Seat pool: claim slots on pre-started delegate proxies
//!
//! A [`SeatStore`] is scoped to one pool (the spec id). Every seat is either
//! claimed by a proxy or sits in the pool's unclaimed set, never both.

mod memory;
mod shared;

pub use memory::MemorySeatStore;
pub use shared::SharedSeatStore;

use crate::error::SeatError;
use crate::model::Seat;
use crate::store::SharedStore;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;

/// Seat counters of one pool, read together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SeatCounts {
    pub seats: usize,
    pub claimed: usize,
    pub unclaimed: usize,
}

pub trait SeatStore: Send + Sync {
    fn pool_id(&self) -> &str;

    /// Add a seat. Unclaimed seats become available immediately.
    fn add_seat(&self, seat: Seat) -> Result<(), SeatError>;

    /// Take any unclaimed seat and mark it claimed by `claiming_proxy_id`.
    /// `None` when the pool is exhausted.
    fn claim_seat(&self, claiming_proxy_id: &str) -> Result<Option<Seat>, SeatError>;

    /// Return a seat to the pool. Releasing an unclaimed seat is a no-op.
    fn release_seat(&self, seat_id: &str) -> Result<(), SeatError>;

    /// Delete all of `seat_ids` if every one of them exists and is unclaimed;
    /// otherwise change nothing and return false
    fn remove_seats_if_unclaimed(&self, seat_ids: &[String]) -> Result<bool, SeatError>;

    fn get_seat(&self, seat_id: &str) -> Result<Option<Seat>, SeatError>;

    /// Snapshot of every seat in the pool
    fn seats(&self) -> Result<Vec<Seat>, SeatError>;

    fn num_unclaimed(&self) -> Result<usize, SeatError>;

    fn num_claimed(&self) -> Result<usize, SeatError>;

    fn num_seats(&self) -> Result<usize, SeatError>;

    /// All three counters from one consistent snapshot
    fn counts(&self) -> Result<SeatCounts, SeatError>;
}

/// Hands out one seat store per pool for the configured strategy
pub struct SeatStoreFactory {
    shared: Option<SharedStore>,
    stores: DashMap<String, Arc<dyn SeatStore>>,
}

impl SeatStoreFactory {
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

    pub fn for_pool(&self, pool_id: &str) -> Arc<dyn SeatStore> {
        self.stores
            .entry(pool_id.to_string())
            .or_insert_with(|| match &self.shared {
                Some(store) => Arc::new(SharedSeatStore::new(store.clone(), pool_id)),
                None => Arc::new(MemorySeatStore::new(pool_id)),
            })
            .clone()
    }

    /// Pools handed out so far
    pub fn pool_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
