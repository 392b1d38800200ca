//! Transport Module
//!
//! Client/server transport events on top of a relay provider.

pub mod client;
pub mod connection;
pub mod delivery;
pub mod event;
pub mod manager;
pub mod server;

// Re-exports for convenience
pub use client::ClientHandler;
pub use connection::{Connection, ConnectionState, Inbound, ReceiveBuffer};
pub use delivery::{map_delivery, DropReason, NetworkDelivery, SendFlags, SendOutcome};
pub use event::{ClientId, EventQueue, NetworkEvent, TransportEvent, TransportStats};
pub use manager::{RelayTransport, RoleKind};
pub use server::ServerHandler;
