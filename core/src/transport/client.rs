//! Client Connection Handler
//!
//! Owns the single outbound relay connection of a client. Every event it
//! produces is addressed to `ClientId::SERVER`.

use super::connection::{Connection, ConnectionState};
use super::delivery::{DropReason, SendFlags, SendOutcome};
use super::event::{ClientId, EventQueue};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::relay::{ConnectionInfo, ReceivedMessage, RelayCallback, RelayProvider, RemoteIdentity};

#[derive(Debug)]
pub struct ClientHandler {
    remote: RemoteIdentity,
    connection: Option<Connection>,
}

impl ClientHandler {
    /// Issue the connect request. Success means the request was accepted,
    /// not that the connection is established.
    pub fn start<P: RelayProvider>(
        provider: &mut P,
        remote: RemoteIdentity,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        if !remote.is_valid() {
            return Err(TransportError::InvalidRemote(remote));
        }
        let handle = provider.connect_relay(remote, config.virtual_port)?;
        tracing::info!("Connecting to relay peer {} on {}", remote, handle);

        Ok(ClientHandler {
            remote,
            connection: Some(Connection::new(
                handle,
                config.max_message_size,
                config.oversized_policy,
            )),
        })
    }

    pub fn remote(&self) -> RemoteIdentity {
        self.remote
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map(Connection::is_connected)
            .unwrap_or(false)
    }

    /// Drain pending provider callbacks for our connection
    pub fn receive<P: RelayProvider>(&mut self, provider: &mut P, events: &mut EventQueue) {
        let Some(handle) = self.connection.as_ref().map(|c| c.handle) else {
            return;
        };
        for callback in provider.receive_on_connection(handle) {
            if callback.connection() != handle {
                tracing::debug!("Ignoring callback for foreign handle {}", callback.connection());
                continue;
            }
            match callback {
                RelayCallback::Connecting { info, .. } => self.on_connecting(&info),
                RelayCallback::Connected { .. } => self.on_connected(events),
                RelayCallback::Disconnected { info, .. } => {
                    self.on_disconnected(provider, &info, events)
                }
                RelayCallback::Message { message, .. } => self.on_message(&message, events),
            }
        }
    }

    pub fn on_connecting(&mut self, info: &ConnectionInfo) {
        tracing::debug!("ClientHandler: connecting to {}", info.remote);
    }

    pub fn on_connected(&mut self, events: &mut EventQueue) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        if conn.mark_connected() {
            tracing::info!("Connected to relay peer {}", self.remote);
            events.connect(ClientId::SERVER);
        }
    }

    /// Report the disconnect once, then release the handle
    pub fn on_disconnected<P: RelayProvider>(
        &mut self,
        provider: &mut P,
        info: &ConnectionInfo,
        events: &mut EventQueue,
    ) {
        let Some(mut conn) = self.connection.take() else {
            return;
        };
        if conn.state == ConnectionState::Connecting {
            tracing::warn!(
                "Connection attempt to {} failed ({:?})",
                self.remote,
                info.end_reason
            );
        } else {
            tracing::info!(
                "Disconnected from relay peer {} ({:?})",
                self.remote,
                info.end_reason
            );
        }
        if conn.mark_disconnected() {
            events.disconnect(ClientId::SERVER);
        }
        provider.close_connection(conn.handle);
    }

    pub fn on_message(&mut self, message: &ReceivedMessage, events: &mut EventQueue) {
        if let Some(conn) = self.connection.as_mut() {
            events.message(ClientId::SERVER, conn, &message.data);
        }
    }

    pub fn send<P: RelayProvider>(
        &mut self,
        provider: &mut P,
        payload: &[u8],
        flags: SendFlags,
    ) -> SendOutcome {
        let Some(conn) = self.connection.as_ref() else {
            return SendOutcome::Dropped(DropReason::NoConnection);
        };
        if !conn.is_connected() {
            return SendOutcome::Dropped(DropReason::NotConnected);
        }
        match provider.send_message(conn.handle, payload, flags) {
            Ok(()) => SendOutcome::Sent,
            Err(e) => {
                tracing::warn!("Send to server failed: {}", e);
                SendOutcome::Dropped(DropReason::Provider(e))
            }
        }
    }

    /// Close our connection. Idempotent; no event follows a local close.
    pub fn disconnect_local<P: RelayProvider>(&mut self, provider: &mut P) {
        if let Some(mut conn) = self.connection.take() {
            tracing::info!("Closing connection to relay peer {}", self.remote);
            conn.mark_disconnected();
            provider.close_connection(conn.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::relay::{LoopbackNetwork, LoopbackProvider};
    use crate::transport::NetworkEvent;

    const SERVER: RemoteIdentity = RemoteIdentity(1);
    const CLIENT: RemoteIdentity = RemoteIdentity(2);

    /// Client connected to a bare provider-level server
    fn connected_pair() -> (
        LoopbackNetwork,
        LoopbackProvider,
        LoopbackProvider,
        ClientHandler,
        EventQueue,
    ) {
        let network = LoopbackNetwork::new();
        let mut server = network.endpoint(SERVER);
        let mut client = network.endpoint(CLIENT);
        let socket = server.create_relay_socket(0).unwrap();

        let mut handler =
            ClientHandler::start(&mut client, SERVER, &TransportConfig::default()).unwrap();
        let server_conn = server.receive_on_socket(socket)[0].connection();
        server.accept(server_conn).unwrap();

        let mut events = EventQueue::new();
        handler.receive(&mut client, &mut events);
        (network, server, client, handler, events)
    }

    #[test]
    fn test_invalid_remote_is_rejected() {
        let network = LoopbackNetwork::new();
        let mut client = network.endpoint(CLIENT);
        let result = ClientHandler::start(&mut client, RemoteIdentity(0), &TransportConfig::default());
        assert_eq!(
            result.unwrap_err(),
            TransportError::InvalidRemote(RemoteIdentity(0))
        );

        let result = ClientHandler::start(&mut client, SERVER, &TransportConfig::default());
        assert_eq!(
            result.unwrap_err(),
            TransportError::Provider(ProviderError::UnknownIdentity(SERVER))
        );
    }

    #[test]
    fn test_connect_emits_single_server_event() {
        let (_network, _server, _client, handler, mut events) = connected_pair();
        assert!(handler.is_connected());

        let event = events.pop();
        assert_eq!(event.kind(), NetworkEvent::Connect);
        assert_eq!(event.client_id(), ClientId::SERVER);
        assert_eq!(events.pop().kind(), NetworkEvent::Nothing);
    }

    #[test]
    fn test_remote_close_emits_disconnect_and_releases_handle() {
        let (network, mut server, mut client, mut handler, mut events) = connected_pair();
        events.clear();

        server.shutdown();
        handler.receive(&mut client, &mut events);

        let event = events.pop();
        assert_eq!(event.kind(), NetworkEvent::Disconnect);
        assert_eq!(event.client_id(), ClientId::SERVER);
        assert!(handler.connection().is_none());
        assert_eq!(network.open_handles(), 0);

        assert_eq!(
            handler.send(&mut client, b"late", SendFlags::RELIABLE),
            SendOutcome::Dropped(DropReason::NoConnection)
        );
    }

    #[test]
    fn test_refused_attempt_still_reports_disconnect() {
        let network = LoopbackNetwork::new();
        let mut server = network.endpoint(SERVER);
        let mut client = network.endpoint(CLIENT);
        let socket = server.create_relay_socket(0).unwrap();

        let mut handler =
            ClientHandler::start(&mut client, SERVER, &TransportConfig::default()).unwrap();
        let server_conn = server.receive_on_socket(socket)[0].connection();
        server.close_connection(server_conn);

        let mut events = EventQueue::new();
        handler.receive(&mut client, &mut events);

        let event = events.pop();
        assert_eq!(event.kind(), NetworkEvent::Disconnect);
        assert_eq!(event.client_id(), ClientId::SERVER);
        assert_eq!(events.pop().kind(), NetworkEvent::Nothing);
        assert!(handler.connection().is_none());
        assert_eq!(network.open_handles(), 0);
    }

    #[test]
    fn test_send_before_connected_is_dropped() {
        let network = LoopbackNetwork::new();
        let mut server = network.endpoint(SERVER);
        let mut client = network.endpoint(CLIENT);
        server.create_relay_socket(0).unwrap();

        let mut handler =
            ClientHandler::start(&mut client, SERVER, &TransportConfig::default()).unwrap();
        assert_eq!(
            handler.send(&mut client, b"early", SendFlags::UNRELIABLE),
            SendOutcome::Dropped(DropReason::NotConnected)
        );
    }

    #[test]
    fn test_disconnect_local_is_idempotent() {
        let (network, _server, mut client, mut handler, mut events) = connected_pair();
        events.clear();

        handler.disconnect_local(&mut client);
        handler.disconnect_local(&mut client);
        handler.receive(&mut client, &mut events);

        assert!(events.is_empty());
        assert_eq!(network.open_handles(), 1);
    }
}
