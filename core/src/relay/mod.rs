//! Relay Module
//!
//! The relay provider contract and the in-process loopback network.

pub mod loopback;
pub mod provider;

// Re-exports for convenience
pub use loopback::{LoopbackNetwork, LoopbackProvider};
pub use provider::{
    ConnectionHandle, ConnectionInfo, DebugLevel, DebugMessage, EndReason, ListenSocket,
    ReceivedMessage, RelayCallback, RelayProvider, RemoteIdentity,
};
