//! Server Connection Handler
//!
//! Owns the listening relay socket and the set of inbound connections, keyed
//! by `ClientId`. A connection's `ClientId` is the provider's handle value.

use std::collections::{HashMap, HashSet};

use super::connection::{Connection, ConnectionState};
use super::delivery::{DropReason, SendFlags, SendOutcome};
use super::event::{ClientId, EventQueue};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::relay::{
    ConnectionHandle, ConnectionInfo, ListenSocket, ReceivedMessage, RelayCallback, RelayProvider,
};

#[derive(Debug)]
pub struct ServerHandler {
    socket: ListenSocket,
    connections: HashMap<ClientId, Connection>,
    /// Accepted, waiting for the provider's `Connected`
    pending: HashSet<ConnectionHandle>,
    config: TransportConfig,
}

fn client_id_of(handle: ConnectionHandle) -> ClientId {
    ClientId(u64::from(handle.0))
}

impl ServerHandler {
    /// Create the listening relay socket
    pub fn start<P: RelayProvider>(
        provider: &mut P,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let socket = provider.create_relay_socket(config.virtual_port)?;
        tracing::info!("Listening for relay connections on virtual port {}", config.virtual_port);

        Ok(ServerHandler {
            socket,
            connections: HashMap::new(),
            pending: HashSet::new(),
            config: config.clone(),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, client_id: ClientId) -> Option<&Connection> {
        self.connections.get(&client_id)
    }

    /// Ids of connections that are currently established
    pub fn connected_clients(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_connected())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Drain pending provider callbacks for every connection on our socket
    pub fn receive<P: RelayProvider>(&mut self, provider: &mut P, events: &mut EventQueue) {
        for callback in provider.receive_on_socket(self.socket) {
            match callback {
                RelayCallback::Connecting { conn, info } => {
                    self.on_connecting(provider, conn, &info, events)
                }
                RelayCallback::Connected { conn, .. } => self.on_connected(conn, events),
                RelayCallback::Disconnected { conn, info } => {
                    self.on_disconnected(provider, conn, &info, events)
                }
                RelayCallback::Message { conn, message } => {
                    self.on_message(conn, &message, events)
                }
            }
        }
    }

    /// Accept or close right away; the provider times out undecided connections
    pub fn on_connecting<P: RelayProvider>(
        &mut self,
        provider: &mut P,
        conn: ConnectionHandle,
        info: &ConnectionInfo,
        events: &mut EventQueue,
    ) {
        tracing::debug!("ServerHandler: {} connecting from {}", conn, info.remote);

        if client_id_of(conn).is_server() {
            tracing::error!("Refusing connection with reserved handle {}", conn);
            events.stats.connections_refused += 1;
            provider.close_connection(conn);
            return;
        }
        let open = self.connections.len() + self.pending.len();
        if open >= self.config.max_connections {
            tracing::warn!(
                "Refusing {} from {}: {} connections already open",
                conn,
                info.remote,
                open
            );
            events.stats.connections_refused += 1;
            provider.close_connection(conn);
            return;
        }
        match provider.accept(conn) {
            Ok(()) => {
                self.pending.insert(conn);
            }
            Err(e) => {
                tracing::warn!("Accepting {} failed: {}", conn, e);
                provider.close_connection(conn);
            }
        }
    }

    /// Only handles accepted in `on_connecting` are tracked
    pub fn on_connected(&mut self, conn: ConnectionHandle, events: &mut EventQueue) {
        let client_id = client_id_of(conn);
        if !self.pending.remove(&conn) {
            tracing::warn!("Ignoring Connected for {} that was not accepted", conn);
            return;
        }
        if self.connections.contains_key(&client_id) {
            return;
        }
        let mut connection = Connection::new(
            conn,
            self.config.max_message_size,
            self.config.oversized_policy,
        );
        connection.mark_connected();
        self.connections.insert(client_id, connection);

        tracing::info!("Client {} connected", client_id);
        events.connect(client_id);
    }

    /// Close the handle, report the disconnect, then forget the connection
    pub fn on_disconnected<P: RelayProvider>(
        &mut self,
        provider: &mut P,
        conn: ConnectionHandle,
        info: &ConnectionInfo,
        events: &mut EventQueue,
    ) {
        let client_id = client_id_of(conn);
        provider.close_connection(conn);
        self.pending.remove(&conn);

        let Some(connection) = self.connections.get_mut(&client_id) else {
            tracing::debug!("Untracked {} disconnected ({:?})", conn, info.end_reason);
            return;
        };
        if connection.mark_disconnected() {
            tracing::info!("Client {} disconnected ({:?})", client_id, info.end_reason);
            events.disconnect(client_id);
        }
        self.connections.remove(&client_id);
    }

    pub fn on_message(
        &mut self,
        conn: ConnectionHandle,
        message: &ReceivedMessage,
        events: &mut EventQueue,
    ) {
        let client_id = client_id_of(conn);
        match self.connections.get_mut(&client_id) {
            Some(connection) => events.message(client_id, connection, &message.data),
            None => tracing::debug!("Dropping message from untracked {}", conn),
        }
    }

    pub fn send<P: RelayProvider>(
        &mut self,
        provider: &mut P,
        client_id: ClientId,
        payload: &[u8],
        flags: SendFlags,
    ) -> SendOutcome {
        let Some(connection) = self.connections.get(&client_id) else {
            return SendOutcome::Dropped(DropReason::UnknownClient(client_id));
        };
        if !connection.is_connected() {
            return SendOutcome::Dropped(DropReason::NotConnected);
        }
        match provider.send_message(connection.handle, payload, flags) {
            Ok(()) => SendOutcome::Sent,
            Err(e) => {
                tracing::warn!("Send to client {} failed: {}", client_id, e);
                SendOutcome::Dropped(DropReason::Provider(e))
            }
        }
    }

    /// Request a close. The entry stays until the provider confirms.
    pub fn disconnect_remote<P: RelayProvider>(&mut self, provider: &mut P, client_id: ClientId) {
        let Some(connection) = self.connections.get_mut(&client_id) else {
            tracing::debug!("DisconnectRemoteClient: no client {}", client_id);
            return;
        };
        if connection.state == ConnectionState::Closing {
            return;
        }
        tracing::info!("Disconnecting client {}", client_id);
        connection.state = ConnectionState::Closing;
        provider.close_connection(connection.handle);
    }

    /// Close every connection and the listen socket
    pub fn shutdown<P: RelayProvider>(&mut self, provider: &mut P) {
        for (_, connection) in self.connections.drain() {
            provider.close_connection(connection.handle);
        }
        for conn in self.pending.drain() {
            provider.close_connection(conn);
        }
        provider.close_socket(self.socket);
    }
}
