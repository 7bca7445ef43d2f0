//! Container backends: whatever actually runs the application behind a proxy

use crate::config::ProxySpec;
use crate::error::BackendError;
use crate::model::{Container, ExistingContainerInfo, ProxyRecord};
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

pub trait ContainerBackend: Send + Sync {
    /// Start the containers for `proxy` and return the record with container
    /// ids, targets and runtime values filled in
    fn start_proxy<'a>(
        &'a self,
        user_id: &'a str,
        proxy: ProxyRecord,
        spec: &'a ProxySpec,
    ) -> BoxFuture<'a, Result<ProxyRecord, BackendError>>;

    /// Stop every container of `proxy`. Stopping something already gone is
    /// not an error.
    fn stop_proxy<'a>(&'a self, proxy: &'a ProxyRecord) -> BoxFuture<'a, Result<(), BackendError>>;

    /// Containers still running from before this process started
    fn scan_existing_containers(&self) -> BoxFuture<'_, Result<Vec<ExistingContainerInfo>, BackendError>>;
}

struct LocalChild {
    child: Child,
    grace_period: Duration,
}

/// Runs each proxy as a child process of the server
#[derive(Default)]
pub struct LocalProcessBackend {
    children: DashMap<String, LocalChild>,
}

impl LocalProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running(&self) -> usize {
        self.children.len()
    }

    async fn spawn(&self, user_id: &str, mut proxy: ProxyRecord, spec: &ProxySpec) -> Result<ProxyRecord, BackendError> {
        let start_failed = |reason: String| BackendError::StartFailed {
            proxy_id: proxy.id.clone(),
            reason,
        };

        let argv = spec.argv();
        let Some((program, args)) = argv.split_first() else {
            return Err(start_failed("empty command".to_string()));
        };
        let port = proxy
            .containers
            .first()
            .and_then(|c| c.port)
            .ok_or_else(|| start_failed("no port assigned".to_string()))?;

        info!(proxy_id = %proxy.id, user_id, command = %program, port, "Starting local proxy process");

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.envs(&spec.env);
        cmd.env("PORT", port.to_string());
        cmd.env("FLEETGATE_PROXY_ID", &proxy.id);
        cmd.env("FLEETGATE_USER_ID", user_id);

        let mut child = cmd.spawn().map_err(|e| start_failed(e.to_string()))?;
        let pid = child.id().unwrap_or(0);
        info!(proxy_id = %proxy.id, pid, "Proxy process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(proxy.id.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(proxy.id.clone(), "stderr", stderr);
        }

        let container = Container {
            index: 0,
            id: format!("pid-{}", pid),
            port: Some(port),
            runtime_values: [("pid".to_string(), pid.to_string())].into(),
        };
        proxy.containers = vec![container];
        proxy
            .targets
            .insert("/".to_string(), format!("http://127.0.0.1:{}", port));

        self.children.insert(
            proxy.id.clone(),
            LocalChild {
                child,
                grace_period: spec.shutdown_grace_period(),
            },
        );
        Ok(proxy)
    }

    async fn stop(&self, proxy_id: &str) {
        let Some((_, mut local)) = self.children.remove(proxy_id) else {
            debug!(proxy_id, "No local process to stop");
            return;
        };
        let child = &mut local.child;

        if let Some(pid) = child.id() {
            info!(proxy_id, pid, "Sending SIGTERM to proxy process");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(local.grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(proxy_id, ?status, "Proxy process exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(proxy_id, error = %e, "Error waiting for proxy process to exit");
            }
            Err(_) => {
                warn!(
                    proxy_id,
                    grace_period_secs = local.grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = child.kill().await;
            }
        }
    }
}

impl ContainerBackend for LocalProcessBackend {
    fn start_proxy<'a>(
        &'a self,
        user_id: &'a str,
        proxy: ProxyRecord,
        spec: &'a ProxySpec,
    ) -> BoxFuture<'a, Result<ProxyRecord, BackendError>> {
        Box::pin(self.spawn(user_id, proxy, spec))
    }

    fn stop_proxy<'a>(&'a self, proxy: &'a ProxyRecord) -> BoxFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            self.stop(&proxy.id).await;
            Ok(())
        })
    }

    fn scan_existing_containers(&self) -> BoxFuture<'_, Result<Vec<ExistingContainerInfo>, BackendError>> {
        // children never outlive the server
        Box::pin(async { Ok(Vec::new()) })
    }
}

fn forward_output<R>(proxy_id: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(proxy_id = %proxy_id, stream, "{}", line);
        }
    });
}
