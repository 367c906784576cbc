//! Bus configuration types.

use crate::member::MemberKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Default port for command connections.
pub const DEFAULT_COMMAND_PORT: u16 = 55200;
/// Default advertised data port.
pub const DEFAULT_DATA_PORT: u16 = 55201;
/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
/// Default fixed delay between connect attempts.
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 2000;
/// Default number of connect attempts per cycle (including the first).
pub const DEFAULT_MAX_CONNECT_ATTEMPTS: u32 = 3;

/// Top-level configuration for a bus node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Address this node advertises and binds its command listener on.
    pub address: Ipv4Addr,
    /// Command listener port.
    pub command_port: u16,
    /// Advertised data port.
    pub data_port: u16,
    /// Connection settings for remote members.
    pub connection: ConnectionConfig,
    /// Peers to connect to at startup.
    pub seeds: Vec<MemberKey>,
    /// Default log filter when `RUST_LOG` is not set.
    pub log_level: String,
    /// Metadata tags advertised for the local member.
    pub tags: HashMap<String, String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::LOCALHOST,
            command_port: DEFAULT_COMMAND_PORT,
            data_port: DEFAULT_DATA_PORT,
            connection: ConnectionConfig::default(),
            seeds: Vec::new(),
            log_level: "info".to_string(),
            tags: HashMap::new(),
        }
    }
}

impl BusConfig {
    /// Identity of the local member.
    pub fn local_key(&self) -> MemberKey {
        MemberKey::new(self.address, self.command_port, self.data_port)
    }
}

/// Connect/retry behaviour of a remote member's connection manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Fixed delay between attempts in milliseconds.
    pub retry_interval_ms: u64,
    /// Attempts per connect cycle, including the first.
    pub max_connect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            max_connect_attempts: DEFAULT_MAX_CONNECT_ATTEMPTS,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}
