//! Client configuration
//!
//! Every field has a protocol-standard default, so a config deserialized
//! from a partial document (or built with `ClientConfig::default()`) is
//! immediately usable.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_RECONNECT_INTERVAL_MS, DEFAULT_TCP_PORT, DEFAULT_TIMEOUT_MS, DEFAULT_UNIT_ID,
};

/// Connection and behavior parameters for a Modbus TCP client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Remote host name or address
    pub host: String,
    /// Remote TCP port
    pub port: u16,
    /// Unit/device identifier stamped on every request
    pub unit_id: u8,
    /// Per-request response timeout in milliseconds
    pub timeout_ms: u64,
    /// Whether to reconnect automatically after an unexpected drop
    pub reconnect: bool,
    /// Delay between automatic reconnection attempts in milliseconds
    pub reconnect_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_TCP_PORT,
            unit_id: DEFAULT_UNIT_ID,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            reconnect: true,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
        }
    }
}

impl ClientConfig {
    /// Config for a given endpoint with all other fields at their defaults
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Per-request response timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay between reconnection attempts
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// `host:port` endpoint string for the transport
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
