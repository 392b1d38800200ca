//! Relay Provider Contract
//!
//! The relay network is driven entirely through [`RelayProvider`]. Providers
//! never call back into the transport; instead they queue [`RelayCallback`]s
//! that the transport drains once per tick with `receive_on_*`.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::transport::SendFlags;

/// Identity of a peer in the relay network (e.g. a 64-bit account id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteIdentity(pub u64);

impl RemoteIdentity {
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for RemoteIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Provider-assigned id of one relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u32);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Provider-assigned id of a listening relay socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenSocket(pub u32);

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Still open
    None,
    /// Closed by our side
    Local,
    /// Closed by the remote peer
    Remote,
    /// Could not be established or timed out
    Problem,
}

/// Snapshot of a connection passed along with each callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub remote: RemoteIdentity,
    pub end_reason: EndReason,
}

/// One message as delivered by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub data: Bytes,
}

/// Pending per-connection notification from the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayCallback {
    Connecting {
        conn: ConnectionHandle,
        info: ConnectionInfo,
    },
    Connected {
        conn: ConnectionHandle,
        info: ConnectionInfo,
    },
    Disconnected {
        conn: ConnectionHandle,
        info: ConnectionInfo,
    },
    Message {
        conn: ConnectionHandle,
        message: ReceivedMessage,
    },
}

impl RelayCallback {
    pub fn connection(&self) -> ConnectionHandle {
        match self {
            RelayCallback::Connecting { conn, .. }
            | RelayCallback::Connected { conn, .. }
            | RelayCallback::Disconnected { conn, .. }
            | RelayCallback::Message { conn, .. } => *conn,
        }
    }
}

/// Verbosity of provider diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DebugLevel {
    None,
    Error,
    Warning,
    Msg,
    Verbose,
    Debug,
}

/// A diagnostic line emitted by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    pub level: DebugLevel,
    pub text: String,
}

/// Operations the transport needs from a relay networking library
pub trait RelayProvider {
    /// Process-wide client library startup
    fn init_client(&mut self, app_id: u32) -> Result<(), ProviderError>;

    /// Process-wide heartbeat, once per tick
    fn run_callbacks(&mut self);

    /// Process-wide teardown
    fn shutdown(&mut self);

    /// Start fetching relay network configuration
    fn init_relay_network_access(&mut self);

    fn set_debug_output(&mut self, level: DebugLevel);

    /// Diagnostics collected since the last call
    fn drain_debug_output(&mut self) -> Vec<DebugMessage> {
        Vec::new()
    }

    /// Begin connecting to `remote`. Completion arrives as a later callback.
    fn connect_relay(
        &mut self,
        remote: RemoteIdentity,
        virtual_port: i32,
    ) -> Result<ConnectionHandle, ProviderError>;

    /// Start listening for relay connections
    fn create_relay_socket(&mut self, virtual_port: i32) -> Result<ListenSocket, ProviderError>;

    fn accept(&mut self, conn: ConnectionHandle) -> Result<(), ProviderError>;

    /// Close a connection. Closing an already closed handle is a no-op.
    fn close_connection(&mut self, conn: ConnectionHandle);

    fn close_socket(&mut self, socket: ListenSocket);

    fn send_message(
        &mut self,
        conn: ConnectionHandle,
        data: &[u8],
        flags: SendFlags,
    ) -> Result<(), ProviderError>;

    /// Drain pending callbacks for an outbound connection
    fn receive_on_connection(&mut self, conn: ConnectionHandle) -> Vec<RelayCallback>;

    /// Drain pending callbacks for every connection of a listen socket
    fn receive_on_socket(&mut self, socket: ListenSocket) -> Vec<RelayCallback>;
}
