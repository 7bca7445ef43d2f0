use super::{SeatCounts, SeatStore};
use crate::error::SeatError;
use crate::model::Seat;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Seat pool for a single replica. One lock covers both structures.
pub struct MemorySeatStore {
    pool_id: String,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    seats: HashMap<String, Seat>,
    unclaimed: VecDeque<String>,
}

impl MemorySeatStore {
    pub fn new(pool_id: &str) -> Self {
        Self {
            pool_id: pool_id.to_string(),
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl SeatStore for MemorySeatStore {
    fn pool_id(&self) -> &str {
        &self.pool_id
    }

    fn add_seat(&self, seat: Seat) -> Result<(), SeatError> {
        let mut inner = self.inner.lock();
        if inner.seats.contains_key(&seat.id) {
            return Err(SeatError::DuplicateSeat {
                pool_id: self.pool_id.clone(),
                seat_id: seat.id,
            });
        }
        if !seat.is_claimed() {
            inner.unclaimed.push_back(seat.id.clone());
        }
        inner.seats.insert(seat.id.clone(), seat);
        Ok(())
    }

    fn claim_seat(&self, claiming_proxy_id: &str) -> Result<Option<Seat>, SeatError> {
        let mut inner = self.inner.lock();
        while let Some(seat_id) = inner.unclaimed.pop_front() {
            if let Some(seat) = inner.seats.get_mut(&seat_id) {
                seat.claiming_proxy_id = Some(claiming_proxy_id.to_string());
                return Ok(Some(seat.clone()));
            }
        }
        Ok(None)
    }

    fn release_seat(&self, seat_id: &str) -> Result<(), SeatError> {
        let mut inner = self.inner.lock();
        let seat = inner
            .seats
            .get_mut(seat_id)
            .ok_or_else(|| SeatError::UnknownSeat {
                pool_id: self.pool_id.clone(),
                seat_id: seat_id.to_string(),
            })?;

        if seat.claiming_proxy_id.take().is_some() {
            inner.unclaimed.push_back(seat_id.to_string());
        }
        Ok(())
    }

    fn remove_seats_if_unclaimed(&self, seat_ids: &[String]) -> Result<bool, SeatError> {
        let mut inner = self.inner.lock();
        let all_free = seat_ids
            .iter()
            .all(|id| inner.seats.get(id).is_some_and(|seat| !seat.is_claimed()));
        if !all_free {
            return Ok(false);
        }

        for id in seat_ids {
            inner.seats.remove(id);
        }
        inner.unclaimed.retain(|id| !seat_ids.contains(id));
        Ok(true)
    }

    fn get_seat(&self, seat_id: &str) -> Result<Option<Seat>, SeatError> {
        Ok(self.inner.lock().seats.get(seat_id).cloned())
    }

    fn seats(&self) -> Result<Vec<Seat>, SeatError> {
        Ok(self.inner.lock().seats.values().cloned().collect())
    }

    fn num_unclaimed(&self) -> Result<usize, SeatError> {
        Ok(self.inner.lock().unclaimed.len())
    }

    fn num_claimed(&self) -> Result<usize, SeatError> {
        let inner = self.inner.lock();
        Ok(inner.seats.len() - inner.unclaimed.len())
    }

    fn num_seats(&self) -> Result<usize, SeatError> {
        Ok(self.inner.lock().seats.len())
    }

    fn counts(&self) -> Result<SeatCounts, SeatError> {
        let inner = self.inner.lock();
        Ok(SeatCounts {
            seats: inner.seats.len(),
            claimed: inner.seats.len() - inner.unclaimed.len(),
            unclaimed: inner.unclaimed.len(),
        })
    }
}
