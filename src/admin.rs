use crate::error::{json_error_response, AdminErrorCode};
use crate::heartbeat::HeartbeatService;
use crate::leader::LeaderService;
use crate::pool::PoolManager;
use crate::service::ProxyService;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Everything the admin routes read from
#[derive(Clone)]
pub struct AdminState {
    pub leader: LeaderService,
    pub heartbeats: HeartbeatService,
    pub service: Arc<ProxyService>,
    pub pool: Arc<PoolManager>,
    pub auth_token: Arc<String>,
}

/// Localhost admin API
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: AdminState,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, state: AdminState, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.state.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = self.state.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: tokio::net::TcpStream, state: AdminState) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = state.clone();
        async move { Ok::<_, hyper::Error>(handle_admin_request(req, &state).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

/// Route one admin request
pub async fn handle_admin_request<B>(req: Request<B>, state: &AdminState) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/status") => status(state).await,

        (&Method::POST, path) if path.starts_with("/heartbeat/") || path.starts_with("/logout/") => {
            if !check_auth(&req, &state.auth_token) {
                warn!(path, "Unauthorized admin API request");
                return json_error_response(AdminErrorCode::Unauthorized, "missing or invalid bearer token");
            }
            if let Some(proxy_id) = path.strip_prefix("/heartbeat/") {
                heartbeat(state, proxy_id).await
            } else {
                logout(state, path.trim_start_matches("/logout/"))
            }
        }

        (_, "/health" | "/version" | "/status") => {
            json_error_response(AdminErrorCode::MethodNotAllowed, format!("{} not allowed", method))
        }

        _ => json_error_response(AdminErrorCode::NotFound, format!("no route for {}", path)),
    }
}

async fn status(state: &AdminState) -> Response<Full<Bytes>> {
    let proxies = match state.service.proxies().await {
        Ok(proxies) => proxies,
        Err(e) => return json_error_response(AdminErrorCode::InternalError, e.to_string()),
    };

    let mut pools = serde_json::Map::new();
    for spec_id in state.pool.pooled_specs() {
        match state.pool.seat_counts(&spec_id).await {
            Ok(counts) => {
                pools.insert(spec_id, serde_json::json!(counts));
            }
            Err(e) => return json_error_response(AdminErrorCode::InternalError, e.to_string()),
        }
    }

    let body = serde_json::json!({
        "instance_id": state.leader.instance_id(),
        "config_version": state.leader.config_version(),
        "leader": state.leader.is_leader(),
        "proxies": proxies.len(),
        "tunnels": state.heartbeats.tunnels().len(),
        "pools": pools,
    });
    json_response(StatusCode::OK, body.to_string())
}

async fn heartbeat(state: &AdminState, proxy_id: &str) -> Response<Full<Bytes>> {
    match state.service.get_proxy(proxy_id).await {
        Ok(Some(_)) => {
            state.heartbeats.heartbeat_received(proxy_id);
            response(StatusCode::OK, "ok")
        }
        Ok(None) => json_error_response(AdminErrorCode::NotFound, format!("proxy '{}' not found", proxy_id)),
        Err(e) => json_error_response(AdminErrorCode::InternalError, e.to_string()),
    }
}

fn logout(state: &AdminState, session_id: &str) -> Response<Full<Bytes>> {
    let closed = state.heartbeats.tunnels().close_session(session_id);
    info!(session_id, closed, "Closed tunnels on logout");
    json_response(
        StatusCode::OK,
        serde_json::json!({ "closed": closed }).to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ProxySpec;
    use crate::delegate::DelegateStoreFactory;
    use crate::heartbeat::RequestContext;
    use crate::leader::{LeaderSettings, MemoryLeaseLock};
    use crate::leader::version::MemoryVersionWatermark;
    use crate::seats::SeatStoreFactory;
    use crate::service::tests::{fixture, Fixture};
    use crate::store::RetryPolicy;
    use http_body_util::BodyExt;
    use std::time::Duration;

    fn state(f: &Fixture) -> AdminState {
        let leader = LeaderService::new(
            LeaderSettings {
                instance_id: "node-a".to_string(),
                config_version: 3,
                lease: Duration::from_secs(15),
                renew_interval: Duration::from_secs(5),
                grace_delay: Duration::from_secs(20),
            },
            Arc::new(MemoryLeaseLock::new()),
            Arc::new(MemoryVersionWatermark::new()),
            ManualClock::new(0),
            RetryPolicy::default(),
        );
        AdminState {
            leader,
            heartbeats: f.service.heartbeats().clone(),
            service: Arc::clone(&f.service),
            pool: Arc::new(PoolManager::new(
                Arc::clone(&f.service),
                Arc::new(SeatStoreFactory::memory()),
                Arc::new(DelegateStoreFactory::memory()),
            )),
            auth_token: Arc::new("secret".to_string()),
        }
    }

    fn request(method: Method, path: &str, token: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(()).unwrap()
    }

    async fn body_json(resp: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let f = fixture(vec![]);
        let resp = handle_admin_request(request(Method::GET, "/health", None), &state(&f)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_reports_node_and_pools() {
        let f = fixture(vec![("notebook", ProxySpec::local("sleep").with_pool(2, 1))]);
        let state = state(&f);
        state.pool.reconcile("notebook").await.unwrap();

        let resp = handle_admin_request(request(Method::GET, "/status", None), &state).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["instance_id"], "node-a");
        assert_eq!(body["config_version"], 3);
        assert_eq!(body["leader"], false);
        assert_eq!(body["proxies"], 1);
        assert_eq!(body["pools"]["notebook"]["unclaimed"], 2);
    }

    #[tokio::test]
    async fn test_writes_require_token() {
        let f = fixture(vec![]);
        let state = state(&f);

        let resp = handle_admin_request(request(Method::POST, "/heartbeat/p1", None), &state).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()["X-Fleetgate-Error"], "UNAUTHORIZED");

        let resp = handle_admin_request(request(Method::POST, "/logout/s1", Some("wrong")), &state).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_heartbeat_for_known_proxy() {
        let f = fixture(vec![("app", ProxySpec::local("sleep"))]);
        let state = state(&f);
        let proxy = f.service.start_proxy("alice", "app").await.unwrap();
        f.clock.set(7_000);

        let path = format!("/heartbeat/{}", proxy.id);
        let resp = handle_admin_request(request(Method::POST, &path, Some("secret")), &state).await;
        assert_eq!(resp.status(), StatusCode::OK);

        state.heartbeats.flush().await;
        assert_eq!(state.heartbeats.last_heartbeat(&proxy.id).unwrap(), Some(7_000));

        let resp = handle_admin_request(request(Method::POST, "/heartbeat/nope", Some("secret")), &state).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_logout_closes_session_tunnels() {
        let f = fixture(vec![("app", ProxySpec::local("sleep"))]);
        let state = state(&f);
        let proxy = f.service.start_proxy("alice", "app").await.unwrap();

        let upgrade = Request::builder()
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header(crate::heartbeat::SESSION_HEADER, "s1")
            .body(())
            .unwrap();
        let ctx = RequestContext::from_request(&upgrade);
        let handle = state.heartbeats.attach_heartbeat_checker(&ctx, &proxy).unwrap();

        let resp = handle_admin_request(request(Method::POST, "/logout/s1", Some("secret")), &state).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["closed"], 1);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_route_and_method() {
        let f = fixture(vec![]);
        let state = state(&f);

        let resp = handle_admin_request(request(Method::GET, "/nope", None), &state).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers()["X-Fleetgate-Error"], "NOT_FOUND");

        let resp = handle_admin_request(request(Method::DELETE, "/status", None), &state).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
