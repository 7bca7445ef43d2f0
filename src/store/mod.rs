//! Storage strategies and the optimistic retry helper
//!
//! Every store trait in the crate has an in-memory implementation for a
//! single replica and a shared implementation on top of [`SharedStore`].
//! [`Stores`] builds the matching set for the configured mode.

pub mod shared;

pub use shared::{Plan, SharedStore, Tx, Watch, WriteOp};

use crate::config::{StoreConfig, StoreMode};
use crate::delegate::DelegateStoreFactory;
use crate::error::StoreError;
use crate::heartbeat::store::{HeartbeatStore, MemoryHeartbeatStore, SharedHeartbeatStore};
use crate::leader::lock::{LeaseLock, MemoryLeaseLock, SharedLeaseLock};
use crate::leader::version::{MemoryVersionWatermark, SharedVersionWatermark, VersionWatermark};
use crate::ports::{MemoryPortAllocator, PortAllocator, SharedPortAllocator};
use crate::proxies::{MemoryProxyStore, ProxyStore, SharedProxyStore};
use crate::seats::SeatStoreFactory;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bounded exponential backoff for optimistic transactions
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 32,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based): doubled each time,
    /// capped, with the lower half jittered
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let full = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let millis = full.as_millis() as u64;
        if millis == 0 {
            return full;
        }
        Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
    }
}

/// Result of one optimistic attempt
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    /// A watched key changed before commit; try again
    Conflict,
}

/// Run `attempt` until it completes or the policy gives up.
///
/// `key` only labels logs and the exhaustion error.
pub fn optimistic<T, E>(
    policy: &RetryPolicy,
    key: &str,
    mut attempt: impl FnMut() -> Result<Attempt<T>, E>,
) -> Result<T, E>
where
    E: From<StoreError>,
{
    let max_attempts = policy.max_attempts.max(1);
    for n in 1..=max_attempts {
        match attempt()? {
            Attempt::Done(value) => return Ok(value),
            Attempt::Conflict => {
                debug!(key, attempt = n, "Optimistic transaction conflicted");
                if n < max_attempts {
                    std::thread::sleep(policy.delay_for(n));
                }
            }
        }
    }

    warn!(key, attempts = max_attempts, "Giving up on contended transaction");
    Err(StoreError::ContentionExhausted {
        key: key.to_string(),
        attempts: max_attempts,
    }
    .into())
}

/// Run a store call on the blocking pool.
///
/// Store calls block on SQLite I/O and sleep between optimistic retries, so
/// async code never runs them on a runtime worker directly.
pub async fn blocking<T, E, F>(call: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<StoreError> + Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(result) => result,
        Err(e) => Err(StoreError::TaskFailed(e.to_string()).into()),
    }
}

/// The full set of stores for one replica
#[derive(Clone)]
pub struct Stores {
    pub seats: Arc<SeatStoreFactory>,
    pub delegates: Arc<DelegateStoreFactory>,
    pub ports: Arc<dyn PortAllocator>,
    pub heartbeats: Arc<dyn HeartbeatStore>,
    pub proxies: Arc<dyn ProxyStore>,
    pub lease_lock: Arc<dyn LeaseLock>,
    pub watermark: Arc<dyn VersionWatermark>,
    shared: Option<SharedStore>,
}

impl Stores {
    /// Single-replica stores
    pub fn memory() -> Self {
        Self {
            seats: Arc::new(SeatStoreFactory::memory()),
            delegates: Arc::new(DelegateStoreFactory::memory()),
            ports: Arc::new(MemoryPortAllocator::new()),
            heartbeats: Arc::new(MemoryHeartbeatStore::new()),
            proxies: Arc::new(MemoryProxyStore::new()),
            lease_lock: Arc::new(MemoryLeaseLock::new()),
            watermark: Arc::new(MemoryVersionWatermark::new()),
            shared: None,
        }
    }

    /// Stores shared with every replica that opens the same database
    pub fn shared(store: SharedStore) -> Self {
        Self {
            seats: Arc::new(SeatStoreFactory::shared(store.clone())),
            delegates: Arc::new(DelegateStoreFactory::shared(store.clone())),
            ports: Arc::new(SharedPortAllocator::new(store.clone())),
            heartbeats: Arc::new(SharedHeartbeatStore::new(store.clone())),
            proxies: Arc::new(SharedProxyStore::new(store.clone())),
            lease_lock: Arc::new(SharedLeaseLock::new(store.clone())),
            watermark: Arc::new(SharedVersionWatermark::new(store.clone())),
            shared: Some(store),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        match config.mode {
            StoreMode::Memory => {
                info!("Using in-memory stores");
                Ok(Self::memory())
            }
            StoreMode::Shared => {
                let store =
                    SharedStore::open(&config.path, &config.realm, RetryPolicy::from_config(config))?;
                Ok(Self::shared(store))
            }
        }
    }

    /// Whether state is visible to other replicas
    pub fn is_shared(&self) -> bool {
        self.shared.is_some()
    }
}
