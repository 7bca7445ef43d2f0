//! Fleetgate - control plane for a container-backed application proxy
//!
//! This library provides the state and coordination layer behind a proxy
//! that runs one application container (or a seat on a shared one) per user:
//! - Seat pools carved from pre-started delegate proxies
//! - Liveness tracking from proxied traffic and WebSocket keepalive probes
//! - Reclaim of proxies that stopped sending heartbeats
//! - Leader election with a config-version watermark for rolling upgrades
//! - Port allocation for proxy containers
//!
//! Every store comes in an in-memory flavour for a single replica and a
//! shared flavour backed by a SQLite file that several replicas open.

pub mod admin;
pub mod backend;
pub mod clock;
pub mod config;
pub mod delegate;
pub mod error;
pub mod heartbeat;
pub mod leader;
pub mod model;
pub mod pool;
pub mod ports;
pub mod proxies;
pub mod reclaim;
pub mod seats;
pub mod service;
pub mod store;
