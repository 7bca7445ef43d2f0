//! Leader election
//!
//! Each node periodically tries to take or renew a lease on the shared leader
//! lock. Before contending, a node checks the config-version watermark: a node
//! running an older config never contends, and a leader that sees a newer
//! version appear keeps leading for a grace period (so the new nodes can come
//! up) and then steps down.

pub mod event_loop;
pub mod lock;
pub mod version;

pub use event_loop::{GlobalEventLoop, Leadership, TaskKind};
pub use lock::{LeaseLock, MemoryLeaseLock, SharedLeaseLock};
pub use version::{check_latest_version, VersionWatermark, Versioned};

use crate::clock::SharedClock;
use crate::error::StoreError;
use crate::store::RetryPolicy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LeaderSettings {
    pub instance_id: String,
    pub config_version: u64,
    pub lease: Duration,
    pub renew_interval: Duration,
    pub grace_delay: Duration,
}

type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Hooks {
    granted: Vec<Hook>,
    revoked: Vec<Hook>,
}

struct Inner {
    settings: LeaderSettings,
    lock: Arc<dyn LeaseLock>,
    watermark: Arc<dyn VersionWatermark>,
    clock: SharedClock,
    retry: RetryPolicy,
    leader: AtomicBool,
    lease_deadline: AtomicI64,
    /// When this node first saw a newer version while leading
    superseded_at: Mutex<Option<i64>>,
    /// Serializes ticks so transitions and hooks never interleave
    tick_lock: Mutex<()>,
    hooks: Mutex<Hooks>,
}

/// Leader election for one node
#[derive(Clone)]
pub struct LeaderService {
    inner: Arc<Inner>,
}

impl LeaderService {
    pub fn new(
        settings: LeaderSettings,
        lock: Arc<dyn LeaseLock>,
        watermark: Arc<dyn VersionWatermark>,
        clock: SharedClock,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                lock,
                watermark,
                clock,
                retry,
                leader: AtomicBool::new(false),
                lease_deadline: AtomicI64::new(0),
                superseded_at: Mutex::new(None),
                tick_lock: Mutex::new(()),
                hooks: Mutex::new(Hooks::default()),
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.settings.instance_id
    }

    pub fn config_version(&self) -> u64 {
        self.inner.settings.config_version
    }

    /// Run `hook` every time this node becomes leader
    pub fn on_granted(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.inner.hooks.lock().granted.push(Arc::new(hook));
    }

    /// Run `hook` every time this node stops being leader
    pub fn on_revoked(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.inner.hooks.lock().revoked.push(Arc::new(hook));
    }

    /// True while this node holds an unexpired lease
    pub fn is_leader(&self) -> bool {
        self.inner.leader.load(Ordering::SeqCst)
            && self.inner.clock.now_millis() < self.inner.lease_deadline.load(Ordering::SeqCst)
    }

    /// One election round. Blocks on store I/O.
    pub fn tick(&self) -> Result<(), StoreError> {
        let inner = &self.inner;
        let _serial = inner.tick_lock.lock();
        let now = inner.clock.now_millis();
        let was_leader = inner.leader.load(Ordering::SeqCst);
        let id = inner.settings.instance_id.as_str();

        let latest = check_latest_version(
            inner.watermark.as_ref(),
            inner.settings.config_version,
            &inner.retry,
        )?;

        if !latest {
            if !was_leader {
                debug!(instance_id = id, "Outdated config version, not contending");
                return Ok(());
            }

            let since = *inner.superseded_at.lock().get_or_insert(now);
            if now - since >= inner.settings.grace_delay.as_millis() as i64 {
                info!(instance_id = id, "Newer config version took over, stepping down");
                inner.lock.release(id)?;
                self.revoke();
                return Ok(());
            }
            debug!(instance_id = id, "Newer config version seen, leading until grace delay ends");
        }

        if inner.lock.try_acquire(id, now, inner.settings.lease)? {
            inner
                .lease_deadline
                .store(now + inner.settings.lease.as_millis() as i64, Ordering::SeqCst);
            if !was_leader {
                inner.leader.store(true, Ordering::SeqCst);
                *inner.superseded_at.lock() = None;
                info!(instance_id = id, "Leadership granted");
                self.fire(true);
            }
        } else if was_leader {
            warn!(instance_id = id, "Lost leader lease");
            self.revoke();
        }
        Ok(())
    }

    /// Release the lock and fire the revoked hooks if leading
    pub fn step_down(&self) -> Result<(), StoreError> {
        let _serial = self.inner.tick_lock.lock();
        if self.inner.leader.load(Ordering::SeqCst) {
            self.inner.lock.release(&self.inner.settings.instance_id)?;
            info!(instance_id = %self.inner.settings.instance_id, "Stepped down");
            self.revoke();
        }
        Ok(())
    }

    fn revoke(&self) {
        self.inner.leader.store(false, Ordering::SeqCst);
        self.inner.lease_deadline.store(0, Ordering::SeqCst);
        *self.inner.superseded_at.lock() = None;
        self.fire(false);
    }

    fn fire(&self, granted: bool) {
        // clone out so a hook may register further hooks
        let hooks: Vec<Hook> = {
            let all = self.inner.hooks.lock();
            if granted {
                all.granted.clone()
            } else {
                all.revoked.clone()
            }
        };
        for hook in hooks {
            hook();
        }
    }

    /// Tick every renew interval until shutdown, then step down
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.inner.settings.renew_interval);
        info!(
            instance_id = %self.inner.settings.instance_id,
            config_version = self.inner.settings.config_version,
            "Leader election started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let service = self.clone();
                    match tokio::task::spawn_blocking(move || service.tick()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(error = %e, "Leader election round failed"),
                        Err(e) => warn!(error = %e, "Leader election task failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let service = self.clone();
        match tokio::task::spawn_blocking(move || service.step_down()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to release leader lock"),
            Err(e) => warn!(error = %e, "Leader step-down task failed"),
        }
    }
}

impl Leadership for LeaderService {
    fn is_leader(&self) -> bool {
        LeaderService::is_leader(self)
    }
}
