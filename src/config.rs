use crate::leader::LeaderSettings;
use crate::reclaim::HeartbeatTimeouts;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

/// Global configuration for a fleetgate node
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Where shared state lives
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Host ports handed to proxies whose spec asks for allocation
    #[serde(default)]
    pub ports: PortRangeConfig,

    #[serde(default)]
    pub leader: LeaderConfig,

    /// Proxy specs keyed by spec id
    #[serde(default)]
    pub specs: HashMap<String, ProxySpec>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port for the localhost admin API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for admin API write operations.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Identity of this node in leader election (default: random uuid)
    pub instance_id: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            admin_port: default_admin_port(),
            admin_token: None,
            instance_id: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// State lives in this process only
    #[default]
    Memory,
    /// State lives in a SQLite file shared by every replica
    Shared,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub mode: StoreMode,

    /// Database file (shared mode only)
    #[serde(default = "default_store_path")]
    pub path: String,

    /// Key namespace, so several deployments can share one database
    #[serde(default = "default_realm")]
    pub realm: String,

    /// Attempts for a contended transaction before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: StoreMode::default(),
            path: default_store_path(),
            realm: default_realm(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HeartbeatConfig {
    /// Minimum interval between persisted heartbeats per proxy
    #[serde(default = "default_heartbeat_rate")]
    pub rate_ms: u64,

    /// Inactivity timeout; zero or negative disables reclaim
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: i64,
}

impl HeartbeatConfig {
    pub fn rate(&self) -> Duration {
        Duration::from_millis(self.rate_ms)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            rate_ms: default_heartbeat_rate(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortRangeConfig {
    #[serde(default = "default_range_from")]
    pub range_from: u16,

    #[serde(default = "default_range_to")]
    pub range_to: u16,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            range_from: default_range_from(),
            range_to: default_range_to(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LeaderConfig {
    /// Bumped on every rollout; nodes on an older version never lead
    #[serde(default = "default_config_version")]
    pub config_version: u64,

    #[serde(default = "default_lease")]
    pub lease_ms: u64,

    #[serde(default = "default_renew_interval")]
    pub renew_interval_ms: u64,

    /// How long a superseded leader keeps leading before stepping down
    #[serde(default = "default_grace_delay")]
    pub grace_delay_ms: u64,
}

impl LeaderConfig {
    pub fn settings(&self, instance_id: &str) -> LeaderSettings {
        LeaderSettings {
            instance_id: instance_id.to_string(),
            config_version: self.config_version,
            lease: Duration::from_millis(self.lease_ms),
            renew_interval: Duration::from_millis(self.renew_interval_ms),
            grace_delay: Duration::from_millis(self.grace_delay_ms),
        }
    }
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            lease_ms: default_lease(),
            renew_interval_ms: default_renew_interval(),
            grace_delay_ms: default_grace_delay(),
        }
    }
}

/// How to run one kind of application proxy
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ProxySpec {
    /// Command to run; may carry its own shell-quoted arguments
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Fixed port the application listens on (0 = allocate from the range)
    #[serde(default)]
    pub port: u16,

    /// Inactivity timeout (overrides `[heartbeat] timeout_ms`)
    pub heartbeat_timeout_ms: Option<i64>,

    /// Grace period in seconds between SIGTERM and SIGKILL
    pub shutdown_grace_period_secs: Option<u64>,

    /// Seats carved from each delegate proxy; set to enable pooling
    pub seats_per_container: Option<usize>,

    /// Unclaimed seats the pool keeps ready
    #[serde(default)]
    pub minimum_seats_available: usize,
}

impl ProxySpec {
    pub fn local(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            port: 0,
            heartbeat_timeout_ms: None,
            shutdown_grace_period_secs: None,
            seats_per_container: None,
            minimum_seats_available: 0,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_pool(mut self, seats_per_container: usize, minimum_seats_available: usize) -> Self {
        self.seats_per_container = Some(seats_per_container);
        self.minimum_seats_available = minimum_seats_available;
        self
    }

    pub fn heartbeat_timeout_ms(&self, defaults: &HeartbeatConfig) -> i64 {
        self.heartbeat_timeout_ms.unwrap_or(defaults.timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(
            self.shutdown_grace_period_secs
                .unwrap_or(default_shutdown_grace_period()),
        )
    }

    pub fn is_pooled(&self) -> bool {
        self.seats_per_container.is_some_and(|n| n > 0)
    }

    /// Program and arguments, with `command` split shell-style
    pub fn argv(&self) -> Vec<String> {
        let mut argv = shell_words::split(&self.command)
            .unwrap_or_else(|_| vec![self.command.clone()]);
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Hex SHA-256 over the spec's canonical JSON. Delegates started from a
    /// spec with a different fingerprint are retired.
    pub fn fingerprint(&self) -> String {
        // BTreeMap env keeps the serialization stable
        let json = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&json))
    }

    pub fn validate(&self, spec_id: &str) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err(format!("Spec '{}': 'command' must not be empty", spec_id));
        }
        if self.seats_per_container == Some(0) {
            return Err(format!(
                "Spec '{}': 'seats_per_container' must be greater than 0",
                spec_id
            ));
        }
        if self.minimum_seats_available > 0 && !self.is_pooled() {
            return Err(format!(
                "Spec '{}': 'minimum_seats_available' requires 'seats_per_container'",
                spec_id
            ));
        }
        Ok(())
    }
}

// Default value functions
fn default_admin_port() -> u16 {
    9090
}

fn default_store_path() -> String {
    "fleetgate.db".to_string()
}

fn default_realm() -> String {
    "default".to_string()
}

fn default_max_retries() -> u32 {
    32
}

fn default_retry_base_delay() -> u64 {
    5
}

fn default_heartbeat_rate() -> u64 {
    10_000 // 10 seconds
}

fn default_heartbeat_timeout() -> i64 {
    60_000 // 1 minute
}

fn default_range_from() -> u16 {
    20000
}

fn default_range_to() -> u16 {
    20999
}

fn default_config_version() -> u64 {
    1
}

fn default_lease() -> u64 {
    15_000
}

fn default_renew_interval() -> u64 {
    5_000
}

fn default_grace_delay() -> u64 {
    20_000
}

fn default_shutdown_grace_period() -> u64 {
    10 // 10 seconds between SIGTERM and SIGKILL
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.ports.range_from > self.ports.range_to {
            errors.push(format!(
                "Port range {}-{} is empty",
                self.ports.range_from, self.ports.range_to
            ));
        }
        if self.heartbeat.rate_ms == 0 {
            errors.push("'heartbeat.rate_ms' must be greater than 0".to_string());
        }
        if self.leader.renew_interval_ms == 0 || self.leader.renew_interval_ms >= self.leader.lease_ms {
            errors.push("'leader.renew_interval_ms' must be between 0 and 'leader.lease_ms'".to_string());
        }
        if self.store.realm.is_empty() {
            errors.push("'store.realm' must not be empty".to_string());
        }

        let mut spec_ids: Vec<_> = self.specs.keys().collect();
        spec_ids.sort();
        for spec_id in spec_ids {
            if let Err(e) = self.specs[spec_id].validate(spec_id) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Per-spec inactivity timeouts, falling back to the global default.
    /// Delegate proxies of pooled specs live until the pool retires them.
    pub fn heartbeat_timeouts(&self) -> HeartbeatTimeouts {
        HeartbeatTimeouts {
            default_ms: self.heartbeat.timeout_ms,
            per_spec: self
                .specs
                .iter()
                .filter_map(|(id, spec)| {
                    if spec.is_pooled() {
                        return Some((id.clone(), 0));
                    }
                    spec.heartbeat_timeout_ms.map(|t| (id.clone(), t))
                })
                .collect(),
        }
    }
}
