//! Proxy lifecycle: start, stop and recover proxies through a backend
//!
//! Every state change goes through the proxy store so other replicas see it.
//! Stopping is idempotent: whoever moves a proxy to Stopping first does the
//! cleanup, everyone else returns immediately.

use crate::backend::ContainerBackend;
use crate::clock::SharedClock;
use crate::config::ProxySpec;
use crate::error::{PortError, ProxyError};
use crate::heartbeat::HeartbeatService;
use crate::model::{Container, ProxyRecord, ProxyStatus};
use crate::ports::PortAllocator;
use crate::proxies::ProxyStore;
use crate::reclaim::ReleaseAction;
use crate::store::blocking;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ProxyService {
    specs: Arc<HashMap<String, ProxySpec>>,
    proxies: Arc<dyn ProxyStore>,
    ports: Arc<dyn PortAllocator>,
    port_range: (u16, u16),
    backend: Arc<dyn ContainerBackend>,
    heartbeats: HeartbeatService,
    clock: SharedClock,
}

impl ProxyService {
    pub fn new(
        specs: Arc<HashMap<String, ProxySpec>>,
        proxies: Arc<dyn ProxyStore>,
        ports: Arc<dyn PortAllocator>,
        port_range: (u16, u16),
        backend: Arc<dyn ContainerBackend>,
        heartbeats: HeartbeatService,
        clock: SharedClock,
    ) -> Self {
        Self {
            specs,
            proxies,
            ports,
            port_range,
            backend,
            heartbeats,
            clock,
        }
    }

    pub fn spec(&self, spec_id: &str) -> Option<&ProxySpec> {
        self.specs.get(spec_id)
    }

    pub fn specs(&self) -> &HashMap<String, ProxySpec> {
        &self.specs
    }

    pub fn heartbeats(&self) -> &HeartbeatService {
        &self.heartbeats
    }

    pub async fn get_proxy(&self, proxy_id: &str) -> Result<Option<ProxyRecord>, ProxyError> {
        let proxy_id = proxy_id.to_string();
        self.with_proxies(move |proxies| proxies.get(&proxy_id)).await
    }

    pub async fn proxies(&self) -> Result<Vec<ProxyRecord>, ProxyError> {
        self.with_proxies(|proxies| proxies.all()).await
    }

    async fn with_proxies<T, F>(&self, call: F) -> Result<T, ProxyError>
    where
        F: FnOnce(&dyn ProxyStore) -> Result<T, ProxyError> + Send + 'static,
        T: Send + 'static,
    {
        let proxies = Arc::clone(&self.proxies);
        blocking(move || call(proxies.as_ref())).await
    }

    async fn with_ports<T, F>(&self, call: F) -> Result<T, ProxyError>
    where
        F: FnOnce(&dyn PortAllocator) -> Result<T, PortError> + Send + 'static,
        T: Send + 'static,
    {
        let ports = Arc::clone(&self.ports);
        Ok(blocking(move || call(ports.as_ref())).await?)
    }

    /// Write `proxy` only if no one moved its stored status off `expected`
    async fn replace_if_status(&self, proxy: ProxyRecord, expected: ProxyStatus) -> Result<bool, ProxyError> {
        self.with_proxies(move |proxies| proxies.replace_if_status(proxy, expected))
            .await
    }

    async fn release_ports(&self, proxy_id: &str) -> Result<(), ProxyError> {
        let owner = proxy_id.to_string();
        self.with_ports(move |ports| ports.release(&owner)).await
    }

    /// Start a proxy for `user_id` and wait until it is Up
    pub async fn start_proxy(&self, user_id: &str, spec_id: &str) -> Result<ProxyRecord, ProxyError> {
        let spec = self
            .specs
            .get(spec_id)
            .ok_or_else(|| ProxyError::UnknownSpec(spec_id.to_string()))?;

        let mut proxy = ProxyRecord::new(spec_id, user_id, self.clock.now_millis());
        let record = proxy.clone();
        self.with_proxies(move |proxies| proxies.add(record)).await?;
        info!(proxy_id = %proxy.id, spec_id, user_id, "Starting proxy");

        let port = match self.reserve_port(&proxy.id, spec).await {
            Ok(port) => port,
            Err(e) => {
                self.abort(&proxy.id).await;
                return Err(e);
            }
        };
        proxy.containers = vec![Container {
            index: 0,
            port: Some(port),
            ..Container::default()
        }];
        proxy.transition(ProxyStatus::Starting)?;
        if !self.replace_if_status(proxy.clone(), ProxyStatus::New).await? {
            info!(proxy_id = %proxy.id, "Proxy stopped before it started");
            self.release_ports(&proxy.id).await?;
            return Err(ProxyError::NotFound(proxy.id));
        }

        let proxy_id = proxy.id.clone();
        let mut started = match self.backend.start_proxy(user_id, proxy, spec).await {
            Ok(started) => started,
            Err(e) => {
                warn!(proxy_id = %proxy_id, spec_id, error = %e, "Backend failed to start proxy");
                self.abort(&proxy_id).await;
                return Err(e.into());
            }
        };

        started.transition(ProxyStatus::Up)?;
        started.startup_at = Some(self.clock.now_millis());

        // a stop may have raced with the backend start; it owns the record then
        if !self.replace_if_status(started.clone(), ProxyStatus::Starting).await? {
            info!(proxy_id = %started.id, "Proxy stopped while starting, tearing down");
            if let Err(e) = self.backend.stop_proxy(&started).await {
                warn!(proxy_id = %started.id, error = %e, "Failed to stop abandoned proxy");
            }
            self.release_ports(&started.id).await?;
            return Err(ProxyError::NotFound(started.id));
        }

        info!(proxy_id = %started.id, spec_id, port, "Proxy is up");
        Ok(started)
    }

    async fn reserve_port(&self, proxy_id: &str, spec: &ProxySpec) -> Result<u16, ProxyError> {
        let owner = proxy_id.to_string();
        if spec.port != 0 {
            let port = spec.port;
            self.with_ports(move |ports| ports.add_existing_port(&owner, port)).await?;
            return Ok(port);
        }
        let (from, to) = self.port_range;
        let port = self.with_ports(move |ports| ports.allocate(from, to, &owner)).await?;
        debug!(proxy_id, port, "Allocated port");
        Ok(port)
    }

    /// Undo a failed start: free ports and walk the record to Stopped
    async fn abort(&self, proxy_id: &str) {
        if let Err(e) = self.release_ports(proxy_id).await {
            warn!(proxy_id, error = %e, "Failed to release ports of failed proxy");
        }

        let id = proxy_id.to_string();
        let removed = self
            .with_proxies(move |proxies| {
                for next in [ProxyStatus::Stopping, ProxyStatus::Stopped] {
                    if let Err(e) = proxies.transition(&id, next) {
                        debug!(proxy_id = %id, error = %e, "Skipping transition of failed proxy");
                    }
                }
                proxies.remove(&id)
            })
            .await;
        if let Err(e) = removed {
            warn!(proxy_id, error = %e, "Failed to remove failed proxy");
        }
    }

    /// Stop a proxy and forget it. Unknown, Stopping and Stopped proxies are
    /// left alone.
    pub async fn stop_proxy(&self, proxy_id: &str) -> Result<(), ProxyError> {
        let id = proxy_id.to_string();
        let stopping = self
            .with_proxies(move |proxies| proxies.transition(&id, ProxyStatus::Stopping))
            .await;
        let proxy = match stopping {
            Ok(proxy) => proxy,
            Err(ProxyError::NotFound(_)) => {
                debug!(proxy_id, "Proxy already gone");
                return Ok(());
            }
            Err(ProxyError::InvalidTransition { from, .. }) if from.is_unavailable() => {
                debug!(proxy_id, status = %from, "Proxy already stopping");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        info!(proxy_id, spec_id = %proxy.spec_id, "Stopping proxy");

        if let Err(e) = self.backend.stop_proxy(&proxy).await {
            warn!(proxy_id, error = %e, "Backend failed to stop proxy, cleaning up anyway");
        }

        self.release_ports(proxy_id).await?;
        let closed = self.heartbeats.tunnels().close_proxy(proxy_id);
        if closed > 0 {
            debug!(proxy_id, closed, "Closed tunnels");
        }

        let heartbeats = self.heartbeats.clone();
        let id = proxy_id.to_string();
        self.with_proxies(move |proxies| {
            heartbeats.remove(&id)?;
            proxies.transition(&id, ProxyStatus::Stopped)?;
            proxies.remove(&id)?;
            Ok(())
        })
        .await?;
        info!(proxy_id, "Proxy stopped");
        Ok(())
    }

    /// Stop every proxy this store knows about
    pub async fn stop_all(&self) {
        let proxies = match self.proxies().await {
            Ok(proxies) => proxies,
            Err(e) => {
                warn!(error = %e, "Failed to list proxies for shutdown");
                return;
            }
        };
        for proxy in proxies {
            if let Err(e) = self.stop_proxy(&proxy.id).await {
                warn!(proxy_id = %proxy.id, error = %e, "Failed to stop proxy on shutdown");
            }
        }
    }

    /// Adopt containers that survived a restart: their ports are marked as
    /// taken and their records re-added as Up
    pub async fn recover(&self) -> Result<usize, ProxyError> {
        let existing = self.backend.scan_existing_containers().await?;
        let mut recovered = 0;

        for info in existing {
            if !self.specs.contains_key(&info.spec_id) {
                warn!(proxy_id = %info.proxy_id, spec_id = %info.spec_id, "Ignoring container of unknown spec");
                continue;
            }

            let mut proxy = ProxyRecord::new(&info.spec_id, &info.user_id, info.startup_at);
            proxy.id = info.proxy_id.clone();
            proxy.target_id = info.proxy_id.clone();
            proxy.status = ProxyStatus::Up;
            proxy.startup_at = Some(info.startup_at);
            if let Some(port) = info.port {
                proxy
                    .targets
                    .insert("/".to_string(), format!("http://127.0.0.1:{}", port));
            }
            proxy.containers = vec![Container {
                index: 0,
                id: info.container_id,
                port: info.port,
                runtime_values: info.runtime_values,
            }];

            let ports = Arc::clone(&self.ports);
            let port = info.port;
            let added = self
                .with_proxies(move |proxies| {
                    if let Some(port) = port {
                        ports.add_existing_port(&proxy.id, port)?;
                    }
                    if proxies.get(&proxy.id)?.is_some() {
                        return Ok(false);
                    }
                    proxies.add(proxy)?;
                    Ok(true)
                })
                .await?;

            if added {
                recovered += 1;
            } else {
                debug!(proxy_id = %info.proxy_id, "Proxy record already present");
            }
        }

        if recovered > 0 {
            info!(recovered, "Recovered existing proxies");
        }
        Ok(recovered)
    }
}

impl ReleaseAction for ProxyService {
    fn release(&self, proxy: ProxyRecord) -> BoxFuture<'_, Result<(), ProxyError>> {
        Box::pin(async move { self.stop_proxy(&proxy.id).await })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::BackendError;
    use crate::heartbeat::store::MemoryHeartbeatStore;
    use crate::heartbeat::{HeartbeatStore, TunnelRegistry};
    use crate::model::ExistingContainerInfo;
    use crate::ports::MemoryPortAllocator;
    use crate::proxies::MemoryProxyStore;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Backend that only records what it was asked to do
    #[derive(Default)]
    pub(crate) struct RecordingBackend {
        pub started: Mutex<Vec<String>>,
        pub stopped: Mutex<Vec<String>>,
        pub fail_starts: Mutex<bool>,
        pub existing: Mutex<Vec<ExistingContainerInfo>>,
        /// Moves the record to Stopping mid-start, as a concurrent stop would
        pub stop_during_start: Mutex<Option<Arc<dyn ProxyStore>>>,
    }

    impl ContainerBackend for RecordingBackend {
        fn start_proxy<'a>(
            &'a self,
            _user_id: &'a str,
            mut proxy: ProxyRecord,
            _spec: &'a ProxySpec,
        ) -> BoxFuture<'a, Result<ProxyRecord, BackendError>> {
            Box::pin(async move {
                if *self.fail_starts.lock() {
                    return Err(BackendError::StartFailed {
                        proxy_id: proxy.id,
                        reason: "refused".to_string(),
                    });
                }
                proxy.containers[0].id = format!("c-{}", proxy.id);
                self.started.lock().push(proxy.id.clone());
                let racing_stop = self.stop_during_start.lock().clone();
                if let Some(proxies) = racing_stop {
                    proxies.transition(&proxy.id, ProxyStatus::Stopping).unwrap();
                }
                Ok(proxy)
            })
        }

        fn stop_proxy<'a>(&'a self, proxy: &'a ProxyRecord) -> BoxFuture<'a, Result<(), BackendError>> {
            Box::pin(async move {
                self.stopped.lock().push(proxy.id.clone());
                Ok(())
            })
        }

        fn scan_existing_containers(
            &self,
        ) -> BoxFuture<'_, Result<Vec<ExistingContainerInfo>, BackendError>> {
            Box::pin(async move { Ok(self.existing.lock().clone()) })
        }
    }

    pub(crate) struct Fixture {
        pub service: Arc<ProxyService>,
        pub backend: Arc<RecordingBackend>,
        pub proxies: Arc<MemoryProxyStore>,
        pub ports: Arc<MemoryPortAllocator>,
        pub heartbeats: Arc<MemoryHeartbeatStore>,
        pub clock: Arc<ManualClock>,
    }

    pub(crate) fn fixture(specs: Vec<(&str, ProxySpec)>) -> Fixture {
        let backend = Arc::new(RecordingBackend::default());
        let ports = Arc::new(MemoryPortAllocator::new());
        let heartbeats = Arc::new(MemoryHeartbeatStore::new());
        let clock = ManualClock::new(1_000);
        let heartbeat_service = HeartbeatService::start(
            heartbeats.clone(),
            clock.clone(),
            Duration::from_secs(10),
            TunnelRegistry::new(),
        );
        let specs = specs
            .into_iter()
            .map(|(id, spec)| (id.to_string(), spec))
            .collect();
        let proxies = Arc::new(MemoryProxyStore::new());
        let service = Arc::new(ProxyService::new(
            Arc::new(specs),
            proxies.clone(),
            ports.clone(),
            (20000, 20001),
            backend.clone(),
            heartbeat_service,
            clock.clone(),
        ));
        Fixture {
            service,
            backend,
            proxies,
            ports,
            heartbeats,
            clock,
        }
    }

    #[tokio::test]
    async fn test_start_proxy_brings_it_up() {
        let f = fixture(vec![("app", ProxySpec::local("sleep"))]);
        f.clock.set(5_000);

        let proxy = f.service.start_proxy("alice", "app").await.unwrap();
        assert_eq!(proxy.status, ProxyStatus::Up);
        assert_eq!(proxy.startup_at, Some(5_000));
        assert_eq!(proxy.ports(), vec![20000]);
        assert_eq!(proxy.containers[0].id, format!("c-{}", proxy.id));

        let stored = f.service.get_proxy(&proxy.id).await.unwrap().unwrap();
        assert_eq!(stored, proxy);
        assert!(f.ports.owned_ports(&proxy.id).unwrap().contains(&20000));
    }

    #[tokio::test]
    async fn test_unknown_spec() {
        let f = fixture(vec![]);
        let err = f.service.start_proxy("alice", "nope").await.unwrap_err();
        assert!(matches!(err, ProxyError::UnknownSpec(_)));
    }

    #[tokio::test]
    async fn test_failed_start_cleans_up() {
        let f = fixture(vec![("app", ProxySpec::local("sleep"))]);
        *f.backend.fail_starts.lock() = true;

        let err = f.service.start_proxy("alice", "app").await.unwrap_err();
        assert!(matches!(err, ProxyError::Backend(BackendError::StartFailed { .. })));
        assert!(f.service.proxies().await.unwrap().is_empty());

        // the port went back to the pool
        *f.backend.fail_starts.lock() = false;
        let proxy = f.service.start_proxy("alice", "app").await.unwrap();
        assert_eq!(proxy.ports(), vec![20000]);
    }

    #[tokio::test]
    async fn test_port_exhaustion_removes_record() {
        let f = fixture(vec![("app", ProxySpec::local("sleep"))]);
        f.service.start_proxy("a", "app").await.unwrap();
        f.service.start_proxy("b", "app").await.unwrap();

        let err = f.service.start_proxy("c", "app").await.unwrap_err();
        assert!(matches!(err, ProxyError::Port(_)));
        assert_eq!(f.service.proxies().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_proxy_is_idempotent() {
        let f = fixture(vec![("app", ProxySpec::local("sleep"))]);
        let proxy = f.service.start_proxy("alice", "app").await.unwrap();
        f.heartbeats.update(&proxy.id, 2_000).unwrap();

        f.service.stop_proxy(&proxy.id).await.unwrap();
        f.service.stop_proxy(&proxy.id).await.unwrap();

        assert_eq!(*f.backend.stopped.lock(), vec![proxy.id.clone()]);
        assert!(f.service.get_proxy(&proxy.id).await.unwrap().is_none());
        assert!(f.ports.owned_ports(&proxy.id).unwrap().is_empty());
        assert_eq!(f.heartbeats.get(&proxy.id).unwrap(), None);
    }

    #[tokio::test]
    async fn test_stop_racing_start_keeps_status_forward() {
        let f = fixture(vec![("app", ProxySpec::local("sleep"))]);
        *f.backend.stop_during_start.lock() = Some(f.proxies.clone() as Arc<dyn ProxyStore>);

        let err = f.service.start_proxy("alice", "app").await.unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));

        // the record stays with the stopper instead of flipping back to Up
        let proxy = f.proxies.all().unwrap().pop().unwrap();
        assert_eq!(proxy.status, ProxyStatus::Stopping);
        assert_eq!(*f.backend.stopped.lock(), vec![proxy.id.clone()]);
        assert!(f.ports.owned_ports(&proxy.id).unwrap().is_empty());

        // and the stopper can still finish
        f.proxies.transition(&proxy.id, ProxyStatus::Stopped).unwrap();
    }

    #[tokio::test]
    async fn test_release_action_stops_proxy() {
        let f = fixture(vec![("app", ProxySpec::local("sleep"))]);
        let proxy = f.service.start_proxy("alice", "app").await.unwrap();

        f.service.release(proxy.clone()).await.unwrap();
        assert!(f.service.get_proxy(&proxy.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_adopts_existing_containers() {
        let f = fixture(vec![("app", ProxySpec::local("sleep"))]);
        f.backend.existing.lock().push(ExistingContainerInfo {
            container_id: "c-old".to_string(),
            proxy_id: "old".to_string(),
            spec_id: "app".to_string(),
            user_id: "alice".to_string(),
            port: Some(20000),
            startup_at: 500,
            runtime_values: HashMap::new(),
        });
        f.backend.existing.lock().push(ExistingContainerInfo {
            container_id: "c-stray".to_string(),
            proxy_id: "stray".to_string(),
            spec_id: "gone".to_string(),
            user_id: "bob".to_string(),
            port: Some(20001),
            startup_at: 500,
            runtime_values: HashMap::new(),
        });

        assert_eq!(f.service.recover().await.unwrap(), 1);
        let old = f.service.get_proxy("old").await.unwrap().unwrap();
        assert_eq!(old.status, ProxyStatus::Up);
        assert_eq!(old.startup_at, Some(500));

        // the recovered port is not handed out again
        let fresh = f.service.start_proxy("carol", "app").await.unwrap();
        assert_eq!(fresh.ports(), vec![20001]);
    }
}
