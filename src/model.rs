//! Records shared between the stores and the services
//!
//! All of these are serialized as JSON when the shared store strategy is in
//! use, so every field has to survive a serde round trip.

use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// A claim slot on a pooled delegate proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seat {
    pub id: String,
    /// Pool the seat belongs to (the spec id)
    pub pool_id: String,
    /// Proxy currently holding the seat, if any
    pub claiming_proxy_id: Option<String>,
}

impl Seat {
    /// Create an unclaimed seat with a random id
    pub fn new(pool_id: &str) -> Self {
        Self::with_id(&Uuid::new_v4().to_string(), pool_id)
    }

    pub fn with_id(id: &str, pool_id: &str) -> Self {
        Self {
            id: id.to_string(),
            pool_id: pool_id.to_string(),
            claiming_proxy_id: None,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.claiming_proxy_id.is_some()
    }
}

/// Lifecycle state of a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    New,
    Starting,
    Up,
    Stopping,
    Stopped,
}

impl ProxyStatus {
    /// Whether `next` is a legal forward transition from this state
    pub fn can_transition_to(self, next: ProxyStatus) -> bool {
        use ProxyStatus::*;
        matches!(
            (self, next),
            (New, Starting)
                | (New, Stopping)
                | (Starting, Up)
                | (Starting, Stopping)
                | (Up, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Stopping or Stopped
    pub fn is_unavailable(self) -> bool {
        matches!(self, ProxyStatus::Stopping | ProxyStatus::Stopped)
    }
}

impl std::fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyStatus::New => write!(f, "new"),
            ProxyStatus::Starting => write!(f, "starting"),
            ProxyStatus::Up => write!(f, "up"),
            ProxyStatus::Stopping => write!(f, "stopping"),
            ProxyStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// A container backing (part of) a proxy
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Container {
    pub index: usize,
    /// Backend-specific identifier, empty until the backend has started it
    pub id: String,
    /// Host port the container listens on
    pub port: Option<u16>,
    #[serde(default)]
    pub runtime_values: HashMap<String, String>,
}

/// A running (or starting, or stopping) application proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub id: String,
    pub spec_id: String,
    /// Id the data plane routes on
    pub target_id: String,
    pub status: ProxyStatus,
    pub user_id: String,
    /// Epoch millis when the record was created
    pub created_at: i64,
    /// Epoch millis when the proxy became Up
    pub startup_at: Option<i64>,
    #[serde(default)]
    pub containers: Vec<Container>,
    /// Path mapping → upstream URL
    #[serde(default)]
    pub targets: HashMap<String, String>,
    #[serde(default)]
    pub runtime_values: HashMap<String, String>,
}

impl ProxyRecord {
    pub fn new(spec_id: &str, user_id: &str, now_millis: i64) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            target_id: id.clone(),
            id,
            spec_id: spec_id.to_string(),
            status: ProxyStatus::New,
            user_id: user_id.to_string(),
            created_at: now_millis,
            startup_at: None,
            containers: Vec::new(),
            targets: HashMap::new(),
            runtime_values: HashMap::new(),
        }
    }

    /// Move to `next`, refusing anything that is not a forward transition
    pub fn transition(&mut self, next: ProxyStatus) -> Result<(), ProxyError> {
        if !self.status.can_transition_to(next) {
            return Err(ProxyError::InvalidTransition {
                proxy_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Every host port held by this proxy's containers
    pub fn ports(&self) -> Vec<u16> {
        self.containers.iter().filter_map(|c| c.port).collect()
    }
}

/// A pooled proxy whose capacity is carved into seats
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateProxy {
    pub proxy: ProxyRecord,
    pub seat_ids: BTreeSet<String>,
    /// Fingerprint of the spec this delegate was started from
    pub spec_fingerprint: String,
}

impl DelegateProxy {
    pub fn id(&self) -> &str {
        &self.proxy.id
    }
}

/// A container found running by a backend during recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingContainerInfo {
    pub container_id: String,
    pub proxy_id: String,
    pub spec_id: String,
    pub user_id: String,
    pub port: Option<u16>,
    pub startup_at: i64,
    #[serde(default)]
    pub runtime_values: HashMap<String, String>,
}
