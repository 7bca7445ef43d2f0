use super::{SeatCounts, SeatStore};
use crate::error::{SeatError, StoreError};
use crate::model::Seat;
use crate::store::{Plan, SharedStore, WriteOp};
use tracing::{debug, warn};

/// Seat pool in the shared store.
///
/// Seats live in the hash `{realm}__seats_{pool}` keyed by seat id; the
/// available ids are queued in the list `{realm}__unclaimed_seat_ids_{pool}`.
pub struct SharedSeatStore {
    store: SharedStore,
    pool_id: String,
    seats_key: String,
    unclaimed_key: String,
}

impl SharedSeatStore {
    pub fn new(store: SharedStore, pool_id: &str) -> Self {
        Self {
            seats_key: store.key(&format!("seats_{}", pool_id)),
            unclaimed_key: store.key(&format!("unclaimed_seat_ids_{}", pool_id)),
            pool_id: pool_id.to_string(),
            store,
        }
    }
}

impl SeatStore for SharedSeatStore {
    fn pool_id(&self) -> &str {
        &self.pool_id
    }

    fn add_seat(&self, seat: Seat) -> Result<(), SeatError> {
        self.store.atomically(|tx| {
            if tx.hget::<Seat>(&self.seats_key, &seat.id)?.is_some() {
                return Err(SeatError::DuplicateSeat {
                    pool_id: self.pool_id.clone(),
                    seat_id: seat.id.clone(),
                });
            }
            tx.hset(&self.seats_key, &seat.id, &seat)?;
            if !seat.is_claimed() {
                tx.push_back(&self.unclaimed_key, &seat.id)?;
            }
            Ok(())
        })
    }

    fn claim_seat(&self, claiming_proxy_id: &str) -> Result<Option<Seat>, SeatError> {
        self.store.atomically(|tx| {
            while let Some(seat_id) = tx.pop_front(&self.unclaimed_key)? {
                let Some(mut seat) = tx.hget::<Seat>(&self.seats_key, &seat_id)? else {
                    warn!(pool_id = %self.pool_id, seat_id = %seat_id, "Dropping unclaimed id without a seat");
                    continue;
                };
                seat.claiming_proxy_id = Some(claiming_proxy_id.to_string());
                tx.hset(&self.seats_key, &seat.id, &seat)?;
                return Ok(Some(seat));
            }
            Ok(None)
        })
    }

    fn release_seat(&self, seat_id: &str) -> Result<(), SeatError> {
        self.store.atomically(|tx| {
            let mut seat = tx
                .hget::<Seat>(&self.seats_key, seat_id)?
                .ok_or_else(|| SeatError::UnknownSeat {
                    pool_id: self.pool_id.clone(),
                    seat_id: seat_id.to_string(),
                })?;

            if seat.claiming_proxy_id.take().is_some() {
                tx.hset(&self.seats_key, seat_id, &seat)?;
                tx.push_back(&self.unclaimed_key, seat_id)?;
            }
            Ok(())
        })
    }

    fn remove_seats_if_unclaimed(&self, seat_ids: &[String]) -> Result<bool, SeatError> {
        let removed = self.store.transact(
            &[self.seats_key.as_str(), self.unclaimed_key.as_str()],
            |tx| {
                let mut writes = Vec::with_capacity(seat_ids.len() * 2);
                for id in seat_ids {
                    match tx.hget::<Seat>(&self.seats_key, id)? {
                        Some(seat) if !seat.is_claimed() => {
                            writes.push(WriteOp::hdel(&self.seats_key, id));
                            writes.push(WriteOp::list_remove(&self.unclaimed_key, id));
                        }
                        _ => return Ok::<_, StoreError>(Plan::done(false)),
                    }
                }
                Ok(Plan::write(true, writes))
            },
        )?;

        if removed {
            debug!(pool_id = %self.pool_id, count = seat_ids.len(), "Removed unclaimed seats");
        }
        Ok(removed)
    }

    fn get_seat(&self, seat_id: &str) -> Result<Option<Seat>, SeatError> {
        Ok(self.store.read(|tx| tx.hget(&self.seats_key, seat_id))?)
    }

    fn seats(&self) -> Result<Vec<Seat>, SeatError> {
        let entries: Vec<(String, Seat)> = self.store.read(|tx| tx.hgetall(&self.seats_key))?;
        Ok(entries.into_iter().map(|(_, seat)| seat).collect())
    }

    fn num_unclaimed(&self) -> Result<usize, SeatError> {
        Ok(self.store.read(|tx| tx.list_len(&self.unclaimed_key))?)
    }

    fn num_claimed(&self) -> Result<usize, SeatError> {
        let (total, unclaimed) = self.store.read(|tx| {
            Ok::<_, StoreError>((tx.hlen(&self.seats_key)?, tx.list_len(&self.unclaimed_key)?))
        })?;
        Ok(total.saturating_sub(unclaimed))
    }

    fn num_seats(&self) -> Result<usize, SeatError> {
        Ok(self.store.read(|tx| tx.hlen(&self.seats_key))?)
    }

    fn counts(&self) -> Result<SeatCounts, SeatError> {
        let (seats, unclaimed) = self.store.read(|tx| {
            Ok::<_, StoreError>((tx.hlen(&self.seats_key)?, tx.list_len(&self.unclaimed_key)?))
        })?;
        Ok(SeatCounts {
            seats,
            claimed: seats.saturating_sub(unclaimed),
            unclaimed,
        })
    }
}
