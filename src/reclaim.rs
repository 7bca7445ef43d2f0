//! Inactivity reclaim
//!
//! Proxies that have been silent for longer than their spec's heartbeat
//! timeout are handed to a [`ReleaseAction`]. The scan itself runs as a
//! leader-only task on the global event loop, so only one node reclaims.

use crate::clock::SharedClock;
use crate::error::ProxyError;
use crate::heartbeat::HeartbeatStore;
use crate::leader::GlobalEventLoop;
use crate::model::{ProxyRecord, ProxyStatus};
use crate::proxies::ProxyStore;
use crate::store::blocking;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What to do with a proxy found inactive
pub trait ReleaseAction: Send + Sync {
    fn release(&self, proxy: ProxyRecord) -> BoxFuture<'_, Result<(), ProxyError>>;
}

/// Heartbeat timeouts in millis. Zero or negative disables reclaim.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatTimeouts {
    pub default_ms: i64,
    pub per_spec: HashMap<String, i64>,
}

impl HeartbeatTimeouts {
    pub fn for_spec(&self, spec_id: &str) -> i64 {
        self.per_spec.get(spec_id).copied().unwrap_or(self.default_ms)
    }
}

/// Whether `proxy` has been silent for longer than `timeout_ms` at `now`.
/// Only Up proxies can expire; the startup time counts as activity.
pub fn is_expired(proxy: &ProxyRecord, last_heartbeat: Option<i64>, timeout_ms: i64, now: i64) -> bool {
    if proxy.status != ProxyStatus::Up || timeout_ms <= 0 {
        return false;
    }
    let started = proxy.startup_at.unwrap_or(proxy.created_at);
    let last_active = last_heartbeat.map_or(started, |beat| beat.max(started));
    now - last_active > timeout_ms
}

/// Outcome of one scan
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReclaimReport {
    pub checked: usize,
    pub released: Vec<String>,
    pub failed: Vec<String>,
}

pub struct ReclaimScheduler {
    proxies: Arc<dyn ProxyStore>,
    heartbeats: Arc<dyn HeartbeatStore>,
    timeouts: HeartbeatTimeouts,
    clock: SharedClock,
    release: Arc<dyn ReleaseAction>,
    period: Duration,
    scan_queued: AtomicBool,
}

impl ReclaimScheduler {
    /// `heartbeat_rate` is the liveness write rate; scans run at twice that
    pub fn new(
        proxies: Arc<dyn ProxyStore>,
        heartbeats: Arc<dyn HeartbeatStore>,
        timeouts: HeartbeatTimeouts,
        clock: SharedClock,
        release: Arc<dyn ReleaseAction>,
        heartbeat_rate: Duration,
    ) -> Self {
        Self {
            proxies,
            heartbeats,
            timeouts,
            clock,
            release,
            period: heartbeat_rate * 2,
            scan_queued: AtomicBool::new(false),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Release every expired proxy once
    pub async fn scan(&self) -> ReclaimReport {
        let mut report = ReclaimReport::default();
        let proxies = Arc::clone(&self.proxies);
        let heartbeats = Arc::clone(&self.heartbeats);
        let candidates = blocking(move || {
            let mut candidates = Vec::new();
            for proxy in proxies.all()? {
                if proxy.status != ProxyStatus::Up {
                    continue;
                }
                let last_heartbeat = heartbeats.get(&proxy.id);
                candidates.push((proxy, last_heartbeat));
            }
            Ok::<_, ProxyError>(candidates)
        })
        .await;
        let candidates = match candidates {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "Failed to list proxies for reclaim");
                return report;
            }
        };

        let now = self.clock.now_millis();
        let mut expired = Vec::new();
        for (proxy, last_heartbeat) in candidates {
            report.checked += 1;

            let timeout_ms = self.timeouts.for_spec(&proxy.spec_id);
            let last_heartbeat = match last_heartbeat {
                Ok(beat) => beat,
                Err(e) => {
                    warn!(proxy_id = %proxy.id, error = %e, "Failed to read heartbeat");
                    continue;
                }
            };

            if is_expired(&proxy, last_heartbeat, timeout_ms, now) {
                info!(
                    proxy_id = %proxy.id,
                    spec_id = %proxy.spec_id,
                    timeout_ms,
                    last_heartbeat = ?last_heartbeat,
                    "Heartbeat timeout reached, releasing proxy"
                );
                expired.push(proxy);
            }
        }

        for proxy in expired {
            let proxy_id = proxy.id.clone();
            match self.release.release(proxy).await {
                Ok(()) => report.released.push(proxy_id),
                Err(e) => {
                    warn!(proxy_id = %proxy_id, error = %e, "Failed to release inactive proxy");
                    report.failed.push(proxy_id);
                }
            }
        }
        report
    }

    /// Queue a leader-only scan every period until shutdown. A scan that is
    /// still waiting in the queue is not queued twice.
    pub async fn run(
        self: Arc<Self>,
        event_loop: GlobalEventLoop,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(self.period);
        interval.tick().await;
        info!(period_ms = self.period.as_millis() as u64, "Reclaim scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.scan_queued.swap(true, Ordering::SeqCst) {
                        debug!("Previous reclaim scan still queued");
                        continue;
                    }
                    // cleared when the task runs or is skipped unrun
                    let guard = QueuedScan(Arc::clone(&self));
                    let queued = event_loop.schedule_leader_only("reclaim", async move {
                        let scheduler = Arc::clone(&guard.0);
                        drop(guard);
                        let report = scheduler.scan().await;
                        if !report.released.is_empty() {
                            info!(released = report.released.len(), "Reclaim scan finished");
                        }
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

/// Marks a scan as queued until the queued task is run or dropped
struct QueuedScan(Arc<ReclaimScheduler>);

impl Drop for QueuedScan {
    fn drop(&mut self) {
        self.0.scan_queued.store(false, Ordering::SeqCst);
    }
}
