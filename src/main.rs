use fleetgate::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use fleetgate::backend::LocalProcessBackend;
use fleetgate::clock::{SharedClock, SystemClock};
use fleetgate::config::Config;
use fleetgate::heartbeat::{HeartbeatService, TunnelRegistry};
use fleetgate::leader::{GlobalEventLoop, LeaderService};
use fleetgate::pool::PoolManager;
use fleetgate::reclaim::{ReclaimScheduler, ReleaseAction};
use fleetgate::service::ProxyService;
use fleetgate::store::{RetryPolicy, Stores};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fleetgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("fleetgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    let instance_id = config
        .server
        .instance_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    print_startup_banner(&config, &instance_id);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let clock: SharedClock = Arc::new(SystemClock);
    let stores = Stores::from_config(&config.store)?;

    let heartbeats = HeartbeatService::start(
        Arc::clone(&stores.heartbeats),
        Arc::clone(&clock),
        config.heartbeat.rate(),
        TunnelRegistry::new(),
    );

    let leader = LeaderService::new(
        config.leader.settings(&instance_id),
        Arc::clone(&stores.lease_lock),
        Arc::clone(&stores.watermark),
        Arc::clone(&clock),
        RetryPolicy::from_config(&config.store),
    );
    let (event_loop, event_loop_handle) = GlobalEventLoop::start(Arc::new(leader.clone()));

    let service = Arc::new(ProxyService::new(
        Arc::new(config.specs.clone()),
        Arc::clone(&stores.proxies),
        Arc::clone(&stores.ports),
        (config.ports.range_from, config.ports.range_to),
        Arc::new(LocalProcessBackend::new()),
        heartbeats.clone(),
        Arc::clone(&clock),
    ));

    match service.recover().await {
        Ok(recovered) => info!(recovered, "Recovery scan complete"),
        Err(e) => warn!(error = %e, "Recovery scan failed"),
    }

    let pool = Arc::new(PoolManager::new(
        Arc::clone(&service),
        Arc::clone(&stores.seats),
        Arc::clone(&stores.delegates),
    ));

    // A new leader fills the pools right away instead of waiting a full period
    {
        let pool = Arc::clone(&pool);
        let event_loop = event_loop.clone();
        leader.on_granted(move || {
            let pool = Arc::clone(&pool);
            event_loop.schedule_leader_only("pool-reconcile", async move {
                pool.reconcile_all().await;
            });
        });
    }
    leader.on_revoked(|| info!("No longer leader, maintenance tasks paused"));

    let reclaim = Arc::new(ReclaimScheduler::new(
        Arc::clone(&stores.proxies),
        Arc::clone(&stores.heartbeats),
        config.heartbeat_timeouts(),
        Arc::clone(&clock),
        Arc::clone(&service) as Arc<dyn ReleaseAction>,
        config.heartbeat.rate(),
    ));
    tokio::spawn(reclaim.run(event_loop.clone(), shutdown_rx.clone()));

    tokio::spawn(Arc::clone(&pool).run(
        event_loop.clone(),
        Duration::from_millis(config.leader.renew_interval_ms),
        shutdown_rx.clone(),
    ));

    let leader_handle = tokio::spawn(leader.clone().run(shutdown_rx.clone()));

    // Create admin server (localhost only)
    let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(
        admin_addr,
        AdminState {
            leader: leader.clone(),
            heartbeats: heartbeats.clone(),
            service: Arc::clone(&service),
            pool: Arc::clone(&pool),
            auth_token: Arc::new(admin_token),
        },
        shutdown_rx.clone(),
    );

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Give up leadership before anything else so another node can take over
    if tokio::time::timeout(Duration::from_secs(5), leader_handle).await.is_err() {
        warn!("Leader step-down timed out");
    }

    if !stores.is_shared() {
        info!("Stopping all proxies...");
        service.stop_all().await;
    } else {
        info!("Shared store in use, leaving proxies to the remaining replicas");
    }

    heartbeats.flush().await;
    event_loop_handle.abort();

    let _ = tokio::time::timeout(Duration::from_secs(5), admin_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config, instance_id: &str) {
    info!(
        name = PKG_NAME,
        version = VERSION,
        instance_id,
        "Starting fleetgate"
    );
    info!(
        mode = ?config.store.mode,
        path = %config.store.path,
        realm = %config.store.realm,
        max_retries = config.store.max_retries,
        "Store settings"
    );
    info!(
        rate_ms = config.heartbeat.rate_ms,
        timeout_ms = config.heartbeat.timeout_ms,
        "Heartbeat settings"
    );
    info!(
        config_version = config.leader.config_version,
        lease_ms = config.leader.lease_ms,
        renew_interval_ms = config.leader.renew_interval_ms,
        grace_delay_ms = config.leader.grace_delay_ms,
        "Leader election settings"
    );
    info!(
        admin_port = config.server.admin_port,
        range_from = config.ports.range_from,
        range_to = config.ports.range_to,
        "Network settings"
    );
    let mut specs: Vec<_> = config.specs.keys().collect();
    specs.sort();
    info!(spec_count = specs.len(), specs = ?specs, "Configured specs");
}
