//! Liveness tracking for running proxies
//!
//! Every proxied request, and every sign of life on an upgraded tunnel, ends
//! up in [`HeartbeatService::heartbeat_received`]. Signals are handed to a
//! writer task over an unbounded channel so the data plane never waits on the
//! store, and a per-node throttle keeps busy proxies from rewriting the same
//! record on every request.

pub mod frame;
pub mod store;
pub mod tunnel;

pub use store::HeartbeatStore;
pub use tunnel::{forward_tunnel, TunnelHandle, TunnelRegistry, TunnelState, TunnelStats};

use crate::clock::SharedClock;
use crate::error::StoreError;
use crate::model::ProxyRecord;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hyper::Request;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Header the data plane uses to pass the user's session id
pub const SESSION_HEADER: &str = "x-fleetgate-session";

/// What the heartbeat checker needs to know about a proxied request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub session_id: Option<String>,
    /// Lowercased value of the Upgrade header, when the request upgrades
    pub upgrade: Option<String>,
}

impl RequestContext {
    pub fn from_request<B>(req: &Request<B>) -> Self {
        let session_id = req
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let upgrade = if is_upgrade_request(req) {
            get_upgrade_type(req)
        } else {
            None
        };
        Self {
            session_id,
            upgrade,
        }
    }

    pub fn is_upgrade(&self) -> bool {
        self.upgrade.is_some()
    }

    pub fn is_websocket(&self) -> bool {
        self.upgrade.as_deref() == Some("websocket")
    }
}

/// Check if a request asks for a connection upgrade
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    // Connection: Upgrade (case-insensitive value check)
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

enum Message {
    Beat { proxy_id: String, at: i64 },
    Flush(oneshot::Sender<()>),
}

struct Inner {
    store: Arc<dyn HeartbeatStore>,
    clock: SharedClock,
    rate: Duration,
    /// Last timestamp this node queued per proxy
    last_queued: DashMap<String, i64>,
    tx: mpsc::UnboundedSender<Message>,
}

impl Inner {
    fn record(&self, proxy_id: &str) {
        let now = self.clock.now_millis();
        let rate = self.rate.as_millis() as i64;

        match self.last_queued.entry(proxy_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if now - *entry.get() < rate {
                    return;
                }
                entry.insert(now);
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
            }
        }

        let message = Message::Beat {
            proxy_id: proxy_id.to_string(),
            at: now,
        };
        if self.tx.send(message).is_err() {
            debug!(proxy_id, "Heartbeat writer gone, dropping heartbeat");
        }
    }
}

/// Liveness ingestion for one node
#[derive(Clone)]
pub struct HeartbeatService {
    inner: Arc<Inner>,
    tunnels: Arc<TunnelRegistry>,
}

impl HeartbeatService {
    /// Create the service and spawn its writer. Must be called inside a
    /// tokio runtime.
    pub fn start(
        store: Arc<dyn HeartbeatStore>,
        clock: SharedClock,
        rate: Duration,
        tunnels: Arc<TunnelRegistry>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_store = Arc::clone(&store);
        tokio::spawn(run_writer(writer_store, rx));

        info!(rate_ms = rate.as_millis() as u64, "Heartbeat service started");
        Self {
            inner: Arc::new(Inner {
                store,
                clock,
                rate,
                last_queued: DashMap::new(),
                tx,
            }),
            tunnels,
        }
    }

    /// Record a liveness signal for `proxy_id`. Never blocks; delivery is
    /// best-effort.
    pub fn heartbeat_received(&self, proxy_id: &str) {
        self.inner.record(proxy_id);
    }

    /// Called for every proxied request. Plain requests count as a heartbeat
    /// right away; upgrade requests get a handle for the tunnel pump.
    pub fn attach_heartbeat_checker(
        &self,
        request: &RequestContext,
        proxy: &ProxyRecord,
    ) -> Option<TunnelHandle> {
        self.heartbeat_received(&proxy.id);
        if !request.is_upgrade() {
            return None;
        }

        let inner = Arc::clone(&self.inner);
        let proxy_id = proxy.id.clone();
        Some(self.tunnels.attach(
            &proxy.id,
            request.session_id.as_deref(),
            request.is_websocket(),
            self.inner.rate,
            Arc::new(move || inner.record(&proxy_id)),
        ))
    }

    /// Latest recorded heartbeat
    pub fn last_heartbeat(&self, proxy_id: &str) -> Result<Option<i64>, StoreError> {
        self.inner.store.get(proxy_id)
    }

    /// Forget a removed proxy
    pub fn remove(&self, proxy_id: &str) -> Result<(), StoreError> {
        self.inner.last_queued.remove(proxy_id);
        self.inner.store.remove(proxy_id)
    }

    pub fn tunnels(&self) -> &Arc<TunnelRegistry> {
        &self.tunnels
    }

    pub fn rate(&self) -> Duration {
        self.inner.rate
    }

    /// Wait until every heartbeat queued so far has been written
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.tx.send(Message::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_writer(store: Arc<dyn HeartbeatStore>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        match message {
            Message::Beat { proxy_id, at } => {
                let store = Arc::clone(&store);
                let written =
                    tokio::task::spawn_blocking(move || store.update(&proxy_id, at).map_err(|e| (proxy_id, e)))
                        .await;
                match written {
                    Ok(Ok(())) => {}
                    Ok(Err((proxy_id, e))) => {
                        warn!(proxy_id = %proxy_id, error = %e, "Failed to store heartbeat");
                    }
                    Err(e) => warn!(error = %e, "Heartbeat write task failed"),
                }
            }
            Message::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Heartbeat writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::heartbeat::store::MemoryHeartbeatStore;

    fn service(clock: Arc<ManualClock>, rate: Duration) -> HeartbeatService {
        HeartbeatService::start(
            Arc::new(MemoryHeartbeatStore::new()),
            clock,
            rate,
            TunnelRegistry::new(),
        )
    }

    fn upgrade_request(upgrade: &str) -> Request<()> {
        Request::builder()
            .uri("/ws")
            .header("Connection", "keep-alive, Upgrade")
            .header("Upgrade", upgrade)
            .header(SESSION_HEADER, "sess-1")
            .body(())
            .unwrap()
    }

    #[test]
    fn test_request_context_plain() {
        let req = Request::builder().uri("/").body(()).unwrap();
        let ctx = RequestContext::from_request(&req);
        assert!(!ctx.is_upgrade());
        assert_eq!(ctx.session_id, None);
    }

    #[test]
    fn test_request_context_websocket() {
        let ctx = RequestContext::from_request(&upgrade_request("WebSocket"));
        assert!(ctx.is_upgrade());
        assert!(ctx.is_websocket());
        assert_eq!(ctx.session_id.as_deref(), Some("sess-1"));
    }

    #[test]
    fn test_upgrade_header_without_connection_is_plain() {
        let req = Request::builder()
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[tokio::test]
    async fn test_heartbeat_is_written() {
        let clock = ManualClock::new(1_000);
        let service = service(clock.clone(), Duration::from_secs(10));

        service.heartbeat_received("p1");
        service.flush().await;
        assert_eq!(service.last_heartbeat("p1").unwrap(), Some(1_000));
    }

    #[tokio::test]
    async fn test_throttle_skips_fresh_writes() {
        let clock = ManualClock::new(1_000);
        let service = service(clock.clone(), Duration::from_secs(10));

        service.heartbeat_received("p1");
        clock.advance(Duration::from_secs(5));
        service.heartbeat_received("p1");
        service.flush().await;
        assert_eq!(service.last_heartbeat("p1").unwrap(), Some(1_000));

        clock.advance(Duration::from_secs(5));
        service.heartbeat_received("p1");
        service.flush().await;
        assert_eq!(service.last_heartbeat("p1").unwrap(), Some(11_000));
    }

    #[tokio::test]
    async fn test_remove_forgets_proxy() {
        let clock = ManualClock::new(1_000);
        let service = service(clock.clone(), Duration::from_secs(10));

        service.heartbeat_received("p1");
        service.flush().await;
        service.remove("p1").unwrap();
        assert_eq!(service.last_heartbeat("p1").unwrap(), None);

        // throttle state is gone too
        service.heartbeat_received("p1");
        service.flush().await;
        assert_eq!(service.last_heartbeat("p1").unwrap(), Some(1_000));
    }

    #[tokio::test]
    async fn test_attach_plain_request_records_heartbeat() {
        let clock = ManualClock::new(7);
        let service = service(clock, Duration::from_secs(10));
        let proxy = ProxyRecord::new("app", "alice", 0);

        let handle = service.attach_heartbeat_checker(&RequestContext::default(), &proxy);
        assert!(handle.is_none());
        service.flush().await;
        assert_eq!(service.last_heartbeat(&proxy.id).unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_attach_upgrade_registers_tunnel() {
        let clock = ManualClock::new(7);
        let service = service(clock, Duration::from_secs(10));
        let proxy = ProxyRecord::new("app", "alice", 0);
        let ctx = RequestContext::from_request(&upgrade_request("websocket"));

        let handle = service.attach_heartbeat_checker(&ctx, &proxy).unwrap();
        assert_eq!(handle.proxy_id(), proxy.id);
        assert_eq!(service.tunnels().len(), 1);

        assert_eq!(service.tunnels().close_session("sess-1"), 1);
        assert!(handle.is_closed());
    }
}
