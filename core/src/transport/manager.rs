//! Transport Manager
//!
//! The public client/server transport. Holds the active role and dispatches
//! every operation to the client or server handler.

use std::time::Duration;

use tokio::sync::mpsc;

use super::client::ClientHandler;
use super::delivery::{map_delivery, DropReason, NetworkDelivery, SendOutcome};
use super::event::{ClientId, EventQueue, TransportEvent, TransportStats};
use super::server::ServerHandler;
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::relay::{DebugLevel, RelayProvider, RemoteIdentity};

/// Lifecycle and role of the transport
#[derive(Debug)]
enum Role {
    Uninitialized,
    Ready,
    Client(ClientHandler),
    Server(ServerHandler),
}

/// Role without the handler, for callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Uninitialized,
    Ready,
    Client,
    Server,
}

impl RoleKind {
    fn name(&self) -> &'static str {
        match self {
            RoleKind::Uninitialized => "uninitialized",
            RoleKind::Ready => "ready",
            RoleKind::Client => "client",
            RoleKind::Server => "server",
        }
    }
}

/// Client/server transport over a relay provider
#[derive(Debug)]
pub struct RelayTransport<P: RelayProvider> {
    provider: P,
    config: TransportConfig,
    role: Role,
    events: EventQueue,
}

impl<P: RelayProvider> RelayTransport<P> {
    pub fn new(provider: P, config: TransportConfig) -> Self {
        RelayTransport {
            provider,
            config,
            role: Role::Uninitialized,
            events: EventQueue::new(),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    pub fn role(&self) -> RoleKind {
        match self.role {
            Role::Uninitialized => RoleKind::Uninitialized,
            Role::Ready => RoleKind::Ready,
            Role::Client(_) => RoleKind::Client,
            Role::Server(_) => RoleKind::Server,
        }
    }

    /// The id that means "the server"
    pub fn server_client_id(&self) -> ClientId {
        ClientId::SERVER
    }

    pub fn stats(&self) -> TransportStats {
        self.events.stats
    }

    /// Ids of connected clients (server role only)
    pub fn connected_clients(&self) -> Vec<ClientId> {
        match &self.role {
            Role::Server(server) => server.connected_clients(),
            _ => Vec::new(),
        }
    }

    /// Enable relay access. Must precede `start_client`/`start_server`.
    pub fn initialize(&mut self) {
        if !matches!(self.role, Role::Uninitialized) {
            tracing::debug!("Initialize: already {}", self.role().name());
            return;
        }
        tracing::info!("Initializing relay transport");
        self.provider.init_relay_network_access();
        if self.config.debug {
            self.provider.set_debug_output(DebugLevel::Debug);
        }
        self.role = Role::Ready;
    }

    fn ensure_ready(&self) -> Result<(), TransportError> {
        match self.role {
            Role::Uninitialized => Err(TransportError::NotInitialized),
            Role::Ready => Ok(()),
            _ => Err(TransportError::AlreadyActive(self.role().name())),
        }
    }

    /// Connect to `remote` as a client
    pub fn start_client(&mut self, remote: RemoteIdentity) -> Result<(), TransportError> {
        self.ensure_ready()?;
        match ClientHandler::start(&mut self.provider, remote, &self.config) {
            Ok(client) => {
                self.role = Role::Client(client);
                Ok(())
            }
            Err(e) => {
                tracing::error!("StartClient failed: {}", e);
                Err(e)
            }
        }
    }

    /// Connect to the configured `server_id`
    pub fn start_client_default(&mut self) -> Result<(), TransportError> {
        self.start_client(self.config.server_id)
    }

    /// Start listening for clients
    pub fn start_server(&mut self) -> Result<(), TransportError> {
        self.ensure_ready()?;
        match ServerHandler::start(&mut self.provider, &self.config) {
            Ok(server) => {
                self.role = Role::Server(server);
                Ok(())
            }
            Err(e) => {
                tracing::error!("StartServer failed: {}", e);
                Err(e)
            }
        }
    }

    /// Best-effort send. Clients always address the server.
    pub fn send(
        &mut self,
        client_id: ClientId,
        payload: &[u8],
        delivery: NetworkDelivery,
    ) -> SendOutcome {
        let flags = map_delivery(delivery);
        let outcome = match &mut self.role {
            Role::Client(client) => client.send(&mut self.provider, payload, flags),
            Role::Server(server) => server.send(&mut self.provider, client_id, payload, flags),
            Role::Uninitialized | Role::Ready => SendOutcome::Dropped(DropReason::NotActive),
        };
        match &outcome {
            SendOutcome::Sent => self.events.stats.messages_sent += 1,
            SendOutcome::Dropped(reason) => {
                tracing::trace!("Dropped send to {}: {:?}", client_id, reason);
                self.events.stats.sends_dropped += 1;
            }
        }
        outcome
    }

    /// Drain provider callbacks into events. Call once per tick.
    pub fn pump(&mut self) {
        match &mut self.role {
            Role::Client(client) => client.receive(&mut self.provider, &mut self.events),
            Role::Server(server) => server.receive(&mut self.provider, &mut self.events),
            Role::Uninitialized | Role::Ready => return,
        }
        if self.config.debug {
            for line in self.provider.drain_debug_output() {
                tracing::debug!("[relay {:?}] {}", line.level, line.text);
            }
        }
    }

    /// Next pending event, or `Nothing`
    pub fn poll_event(&mut self) -> TransportEvent {
        self.events.pop()
    }

    /// Deliver events through a channel instead of `poll_event`
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Number of events waiting for `poll_event`
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub fn disconnect_remote_client(&mut self, client_id: ClientId) {
        if let Role::Server(server) = &mut self.role {
            server.disconnect_remote(&mut self.provider, client_id);
        }
    }

    pub fn disconnect_local_client(&mut self) {
        if let Role::Client(client) = &mut self.role {
            client.disconnect_local(&mut self.provider);
        }
    }

    /// Round trip time is not tracked; always zero
    pub fn get_current_rtt(&self, _client_id: ClientId) -> Duration {
        Duration::ZERO
    }

    /// Tear everything down, including any subscriber. Safe to call at any
    /// time, repeatedly.
    pub fn shutdown(&mut self) {
        let was_initialized = !matches!(self.role, Role::Uninitialized);
        match std::mem::replace(&mut self.role, Role::Uninitialized) {
            Role::Client(mut client) => client.disconnect_local(&mut self.provider),
            Role::Server(mut server) => server.shutdown(&mut self.provider),
            Role::Uninitialized | Role::Ready => {}
        }
        if was_initialized {
            tracing::info!("Shutting down relay transport");
            self.provider.shutdown();
        }
        self.events.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{LoopbackNetwork, LoopbackProvider};
    use crate::transport::NetworkEvent;

    const SERVER: RemoteIdentity = RemoteIdentity(76561198000000001);
    const CLIENT: RemoteIdentity = RemoteIdentity(76561198000000002);

    fn transport(network: &LoopbackNetwork, identity: RemoteIdentity) -> RelayTransport<LoopbackProvider> {
        RelayTransport::new(network.endpoint(identity), TransportConfig::default())
    }

    #[test]
    fn test_start_requires_initialize() {
        let network = LoopbackNetwork::new();
        let mut server = transport(&network, SERVER);

        assert_eq!(server.start_server(), Err(TransportError::NotInitialized));
        server.initialize();
        assert!(server.provider().relay_access());
        assert_eq!(server.role(), RoleKind::Ready);

        server.start_server().unwrap();
        assert_eq!(server.role(), RoleKind::Server);
        assert_eq!(
            server.start_client(CLIENT),
            Err(TransportError::AlreadyActive("server"))
        );
    }

    #[test]
    fn test_inactive_operations_are_noops() {
        let network = LoopbackNetwork::new();
        let mut idle = transport(&network, CLIENT);

        assert_eq!(
            idle.send(ClientId(3), b"x", NetworkDelivery::Reliable),
            SendOutcome::Dropped(DropReason::NotActive)
        );
        idle.pump();
        idle.disconnect_remote_client(ClientId(3));
        idle.disconnect_local_client();
        assert_eq!(idle.poll_event().kind(), NetworkEvent::Nothing);
        assert_eq!(idle.get_current_rtt(ClientId::SERVER), Duration::ZERO);
        assert_eq!(idle.stats().sends_dropped, 1);

        idle.shutdown();
        idle.shutdown();
        assert_eq!(idle.role(), RoleKind::Uninitialized);
    }

    #[test]
    fn test_unreachable_server_fails_without_events() {
        let network = LoopbackNetwork::new();
        let mut client = transport(&network, CLIENT);
        client.initialize();

        assert!(client.start_client(SERVER).is_err());
        assert_eq!(client.role(), RoleKind::Ready);
        client.pump();
        assert_eq!(client.poll_event().kind(), NetworkEvent::Nothing);
        client.shutdown();
        assert_eq!(client.role(), RoleKind::Uninitialized);
    }

    #[test]
    fn test_start_client_default_uses_configured_server() {
        let network = LoopbackNetwork::new();
        let mut server = transport(&network, SERVER);
        server.initialize();
        server.start_server().unwrap();

        let config = TransportConfig {
            server_id: SERVER,
            ..TransportConfig::default()
        };
        let mut client = RelayTransport::new(network.endpoint(CLIENT), config);
        client.initialize();
        client.start_client_default().unwrap();
        assert_eq!(client.role(), RoleKind::Client);
    }

    #[test]
    fn test_client_ignores_target_id() {
        let network = LoopbackNetwork::with_first_handle(7);
        let mut server = transport(&network, SERVER);
        let mut client = transport(&network, CLIENT);
        server.initialize();
        server.start_server().unwrap();
        client.initialize();
        client.start_client(SERVER).unwrap();

        for _ in 0..3 {
            server.pump();
            client.pump();
        }
        assert_eq!(client.poll_event().kind(), NetworkEvent::Connect);
        assert_eq!(server.connected_clients(), vec![ClientId(7)]);

        assert!(client
            .send(ClientId(12345), b"ping", NetworkDelivery::ReliableSequenced)
            .is_sent());
        server.pump();
        let event = server.poll_event();
        assert_eq!(event.kind(), NetworkEvent::Connect);
        let event = server.poll_event();
        assert_eq!(event.kind(), NetworkEvent::Data);
        assert_eq!(event.client_id(), ClientId(7));
        assert_eq!(event.payload(), b"ping");
    }

    #[test]
    fn test_debug_output_drained_during_pump() {
        let network = LoopbackNetwork::new();
        let config = TransportConfig {
            debug: true,
            ..TransportConfig::default()
        };
        let mut server = RelayTransport::new(network.endpoint(SERVER), config);
        server.initialize();
        server.start_server().unwrap();
        server.pump();
        assert!(server.provider_mut().drain_debug_output().is_empty());
    }

    #[test]
    fn test_restart_does_not_reuse_old_subscriber() {
        let network = LoopbackNetwork::new();
        let mut server = transport(&network, SERVER);
        server.initialize();
        server.start_server().unwrap();
        let mut old_session = server.subscribe();

        server.shutdown();
        server.initialize();
        server.start_server().unwrap();

        let mut client = transport(&network, CLIENT);
        client.initialize();
        client.start_client(SERVER).unwrap();
        for _ in 0..3 {
            server.pump();
            client.pump();
        }

        assert_eq!(server.poll_event().kind(), NetworkEvent::Connect);
        assert!(old_session.try_recv().is_err());
    }

    #[test]
    fn test_shutdown_closes_provider() {
        let network = LoopbackNetwork::new();
        let mut server = transport(&network, SERVER);
        server.provider_mut().init_client(480).unwrap();
        server.initialize();
        server.start_server().unwrap();

        server.shutdown();
        assert_eq!(server.provider().app_id(), None);
        assert_eq!(server.role(), RoleKind::Uninitialized);

        server.initialize();
        server.start_server().unwrap();
    }
}
