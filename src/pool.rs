//! Seat pool maintenance
//!
//! Pooled specs keep a number of delegate proxies running ahead of demand.
//! Each delegate is carved into `seats_per_container` seats; claiming a seat
//! hands out a slot on an already running delegate instead of starting a new
//! proxy.
//!
//! When a spec changes, delegates started from the old version are drained:
//! their seats are removed as soon as they are unclaimed, and the delegate is
//! stopped once it has no seats left.

use crate::delegate::{DelegateProxyStore, DelegateStoreFactory};
use crate::error::PoolError;
use crate::leader::GlobalEventLoop;
use crate::model::{DelegateProxy, Seat};
use crate::seats::{SeatCounts, SeatStore, SeatStoreFactory};
use crate::service::ProxyService;
use crate::store::blocking;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Owner of every delegate proxy
pub const POOL_USER: &str = "fleetgate-pool";

/// What one reconcile pass changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub retired: Vec<String>,
    pub seats_removed: usize,
}

pub struct PoolManager {
    service: Arc<ProxyService>,
    seats: Arc<SeatStoreFactory>,
    delegates: Arc<DelegateStoreFactory>,
}

impl PoolManager {
    pub fn new(
        service: Arc<ProxyService>,
        seats: Arc<SeatStoreFactory>,
        delegates: Arc<DelegateStoreFactory>,
    ) -> Self {
        Self {
            service,
            seats,
            delegates,
        }
    }

    /// Ids of every pooled spec, sorted
    pub fn pooled_specs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .service
            .specs()
            .iter()
            .filter(|(_, spec)| spec.is_pooled())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Run `call` against the pool's seat and delegate stores on the
    /// blocking pool
    async fn with_pool<T, F>(&self, spec_id: &str, call: F) -> Result<T, PoolError>
    where
        F: FnOnce(&dyn SeatStore, &dyn DelegateProxyStore) -> Result<T, PoolError> + Send + 'static,
        T: Send + 'static,
    {
        let seats = self.seats.for_pool(spec_id);
        let delegates = self.delegates.for_pool(spec_id);
        blocking(move || call(seats.as_ref(), delegates.as_ref())).await
    }

    pub async fn seat_counts(&self, spec_id: &str) -> Result<SeatCounts, PoolError> {
        self.with_pool(spec_id, |seats, _| Ok(seats.counts()?)).await
    }

    fn ensure_pooled(&self, spec_id: &str) -> Result<(), PoolError> {
        match self.service.spec(spec_id) {
            Some(spec) if spec.is_pooled() => Ok(()),
            _ => Err(PoolError::NotPooled(spec_id.to_string())),
        }
    }

    /// Claim a seat for `claiming_proxy_id` and find the delegate serving it.
    /// `None` when the pool has no unclaimed seat.
    pub async fn claim(
        &self,
        spec_id: &str,
        claiming_proxy_id: &str,
    ) -> Result<Option<(Seat, DelegateProxy)>, PoolError> {
        self.ensure_pooled(spec_id)?;

        let claimer = claiming_proxy_id.to_string();
        let claimed = self
            .with_pool(spec_id, move |seats, delegates| {
                let Some(seat) = seats.claim_seat(&claimer)? else {
                    return Ok(None);
                };
                let delegate = delegates
                    .all()?
                    .into_iter()
                    .find(|d| d.seat_ids.contains(&seat.id));
                if delegate.is_none() {
                    seats.release_seat(&seat.id)?;
                }
                Ok(Some((seat, delegate)))
            })
            .await?;

        match claimed {
            None => {
                debug!(spec_id, "Seat pool exhausted");
                Ok(None)
            }
            Some((seat, Some(delegate))) => {
                info!(
                    spec_id,
                    seat_id = %seat.id,
                    delegate_id = %delegate.id(),
                    claiming_proxy_id,
                    "Seat claimed"
                );
                Ok(Some((seat, delegate)))
            }
            Some((seat, None)) => {
                error!(spec_id, seat_id = %seat.id, "Claimed seat has no delegate proxy, released it");
                Err(PoolError::OrphanSeat {
                    pool_id: spec_id.to_string(),
                    seat_id: seat.id,
                })
            }
        }
    }

    /// Give a seat back to its pool
    pub async fn release(&self, spec_id: &str, seat_id: &str) -> Result<(), PoolError> {
        self.ensure_pooled(spec_id)?;
        let id = seat_id.to_string();
        self.with_pool(spec_id, move |seats, _| Ok(seats.release_seat(&id)?))
            .await?;
        debug!(spec_id, seat_id, "Seat released");
        Ok(())
    }

    /// Drain outdated delegates and top the pool up to its minimum
    pub async fn reconcile(&self, spec_id: &str) -> Result<ReconcileReport, PoolError> {
        let spec = match self.service.spec(spec_id) {
            Some(spec) if spec.is_pooled() => spec.clone(),
            _ => return Err(PoolError::NotPooled(spec_id.to_string())),
        };
        let fingerprint = spec.fingerprint();
        let mut report = ReconcileReport::default();

        let delegates = self
            .with_pool(spec_id, |_, delegates| Ok(delegates.all()?))
            .await?;
        for delegate in delegates {
            if delegate.spec_fingerprint == fingerprint {
                continue;
            }

            let delegate_id = delegate.id().to_string();
            let seat_ids = delegate.seat_ids;
            let id = delegate_id.clone();
            let (removed, remaining) = self
                .with_pool(spec_id, move |seats, delegates| {
                    let mut removable = Vec::new();
                    for seat_id in &seat_ids {
                        let seat = std::slice::from_ref(seat_id);
                        if seats.get_seat(seat_id)?.is_none() || seats.remove_seats_if_unclaimed(seat)? {
                            removable.push(seat_id.clone());
                        }
                    }
                    let remaining = delegates.remove_seat_ids(&id, &removable)?;
                    Ok((removable.len(), remaining))
                })
                .await?;
            report.seats_removed += removed;

            if !remaining.seat_ids.is_empty() {
                debug!(
                    spec_id,
                    delegate_id = %delegate_id,
                    claimed = remaining.seat_ids.len(),
                    "Outdated delegate still has claimed seats"
                );
                continue;
            }

            info!(spec_id, delegate_id = %delegate_id, "Retiring outdated delegate proxy");
            self.service.stop_proxy(&delegate_id).await?;
            let id = delegate_id.clone();
            self.with_pool(spec_id, move |_, delegates| Ok(delegates.remove(&id)?))
                .await?;
            report.retired.push(delegate_id);
        }

        let seats_per_container = spec.seats_per_container.unwrap_or(0);
        let mut unclaimed = self
            .with_pool(spec_id, |seats, _| Ok(seats.num_unclaimed()?))
            .await?;
        while seats_per_container > 0 && unclaimed < spec.minimum_seats_available {
            let proxy = self.service.start_proxy(POOL_USER, spec_id).await?;
            let seats: Vec<Seat> = (0..seats_per_container).map(|_| Seat::new(spec_id)).collect();
            let delegate = DelegateProxy {
                seat_ids: seats.iter().map(|s| s.id.clone()).collect::<BTreeSet<_>>(),
                proxy,
                spec_fingerprint: fingerprint.clone(),
            };
            let delegate_id = delegate.id().to_string();

            // the delegate goes first so every claimable seat resolves
            self.with_pool(spec_id, move |seat_store, delegate_store| {
                delegate_store.add(delegate)?;
                for seat in seats {
                    seat_store.add_seat(seat)?;
                }
                Ok(())
            })
            .await?;
            unclaimed += seats_per_container;

            info!(spec_id, delegate_id = %delegate_id, seats = seats_per_container, "Started delegate proxy");
            report.started.push(delegate_id);
        }

        Ok(report)
    }

    /// Reconcile every pooled spec, logging failures
    pub async fn reconcile_all(&self) {
        for spec_id in self.pooled_specs() {
            match self.reconcile(&spec_id).await {
                Ok(report) if report != ReconcileReport::default() => {
                    info!(
                        spec_id = %spec_id,
                        started = report.started.len(),
                        retired = report.retired.len(),
                        seats_removed = report.seats_removed,
                        "Pool reconciled"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(spec_id = %spec_id, error = %e, "Pool reconcile failed"),
            }
        }
    }

    /// Queue a leader-only reconcile every `interval` until shutdown
    pub async fn run(
        self: Arc<Self>,
        event_loop: GlobalEventLoop,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if self.pooled_specs().is_empty() {
            debug!("No pooled specs, pool maintenance idle");
            return;
        }

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let manager = Arc::clone(&self);
                    let queued = event_loop.schedule_leader_only("pool-reconcile", async move {
                        manager.reconcile_all().await;
                    });
                    if !queued {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
