//! Error types
//!
//! Setup and provider failures are typed errors. Dropped sends are not errors
//! and are reported through [`crate::transport::SendOutcome`] instead.

use thiserror::Error;

use crate::relay::{ConnectionHandle, RemoteIdentity};

/// Failures reported by a relay provider
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Relay client library not initialized")]
    NotInitialized,
    #[error("No relay peer listening for identity {0}")]
    UnknownIdentity(RemoteIdentity),
    #[error("Invalid connection handle {0}")]
    InvalidHandle(ConnectionHandle),
    #[error("Connection {0} is not connected")]
    NotConnected(ConnectionHandle),
    #[error("Virtual port {0} already in use")]
    PortInUse(i32),
    #[error("Message of {size} bytes exceeds provider limit of {max}")]
    MessageTooLarge { size: usize, max: usize },
    #[error("Provider call failed with code {0}")]
    Code(i32),
}

/// Failures surfaced by the transport facade
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport not initialized")]
    NotInitialized,
    #[error("Transport already running as {0}")]
    AlreadyActive(&'static str),
    #[error("Invalid remote identity {0}")]
    InvalidRemote(RemoteIdentity),
    #[error("Relay provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Received message of {size} bytes exceeds limit of {max}")]
    MessageTooLarge { size: usize, max: usize },
}
