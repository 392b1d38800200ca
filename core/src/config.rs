//! Configuration
//!
//! Both structs deserialize from JSON with every field optional.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::relay::RemoteIdentity;

/// Largest message the relay provider delivers in one callback (512 KiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// Public development app id accepted by the relay client library
pub const DEFAULT_APP_ID: u32 = 480;

/// What to do with an inbound message larger than the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OversizedPolicy {
    /// Drop the message and report an error
    #[default]
    Reject,
    /// Deliver only the first `max_message_size` bytes
    Truncate,
}

/// Configuration for the RelayTransport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// For clients, the identity of the server to connect to
    pub server_id: RemoteIdentity,
    /// Enables the provider's verbose diagnostics
    pub debug: bool,
    /// Relay virtual port used for both listening and connecting
    pub virtual_port: i32,
    /// Receive buffer capacity per connection
    pub max_message_size: usize,
    pub oversized_policy: OversizedPolicy,
    /// Server refuses new connections beyond this count
    pub max_connections: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            server_id: RemoteIdentity(0),
            debug: false,
            virtual_port: 0,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            oversized_policy: OversizedPolicy::Reject,
            max_connections: 100,
        }
    }
}

impl TransportConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("Invalid transport config")
    }

    /// Load a config from a JSON file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json_str(&text)
    }
}

/// Process-wide relay client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayClientConfig {
    pub app_id: u32,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        RelayClientConfig {
            app_id: DEFAULT_APP_ID,
        }
    }
}
