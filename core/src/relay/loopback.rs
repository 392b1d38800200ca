//! Loopback Relay Network
//!
//! In-process stand-in for a relay networking library. Every endpoint created
//! from the same [`LoopbackNetwork`] can reach every other endpoint that is
//! listening, and callbacks are queued until the owner drains them, matching
//! the tick-driven delivery of a real relay client.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use rand::Rng;

use super::provider::{
    ConnectionHandle, ConnectionInfo, DebugLevel, DebugMessage, EndReason, ListenSocket,
    ReceivedMessage, RelayCallback, RelayProvider, RemoteIdentity,
};
use crate::config::DEFAULT_MAX_MESSAGE_SIZE;
use crate::error::ProviderError;
use crate::transport::SendFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Connected,
    /// Peer went away; the handle stays allocated until closed locally
    ClosedByPeer,
}

/// One side of a loopback connection
#[derive(Debug)]
struct LinkEnd {
    owner: RemoteIdentity,
    remote: RemoteIdentity,
    peer: ConnectionHandle,
    /// Set for connections accepted through a listen socket
    socket: Option<u32>,
    state: LinkState,
    queue: VecDeque<RelayCallback>,
}

#[derive(Debug)]
struct SocketEntry {
    owner: RemoteIdentity,
    virtual_port: i32,
    queue: VecDeque<RelayCallback>,
}

#[derive(Debug)]
struct NetworkState {
    next_handle: u32,
    next_socket: u32,
    random_handles: bool,
    max_message_size: usize,
    listeners: HashMap<(RemoteIdentity, i32), u32>,
    sockets: HashMap<u32, SocketEntry>,
    links: HashMap<ConnectionHandle, LinkEnd>,
}

impl NetworkState {
    fn alloc_handle(&mut self) -> u32 {
        loop {
            let candidate = if self.random_handles {
                rand::thread_rng().gen_range(1..=u32::MAX)
            } else {
                let next = self.next_handle;
                self.next_handle = self.next_handle.wrapping_add(1).max(1);
                next
            };
            if candidate != 0 && !self.links.contains_key(&ConnectionHandle(candidate)) {
                return candidate;
            }
        }
    }

    /// Queue a callback where the owner of `handle` will drain it
    fn route(&mut self, handle: ConnectionHandle, callback: RelayCallback) {
        let Some(socket) = self.links.get(&handle).map(|end| end.socket) else {
            return;
        };
        if let Some(entry) = socket.and_then(|s| self.sockets.get_mut(&s)) {
            entry.queue.push_back(callback);
        } else if let Some(end) = self.links.get_mut(&handle) {
            end.queue.push_back(callback);
        }
    }

    fn info(&self, handle: ConnectionHandle, end_reason: EndReason) -> ConnectionInfo {
        let remote = self
            .links
            .get(&handle)
            .map(|end| end.remote)
            .unwrap_or(RemoteIdentity(0));
        ConnectionInfo { remote, end_reason }
    }

    /// Close `handle` and notify both sides. Returns false if it was not open.
    fn close(&mut self, handle: ConnectionHandle) -> bool {
        let Some(end) = self.links.get(&handle) else {
            return false;
        };
        let (state, peer) = (end.state, end.peer);

        if state != LinkState::ClosedByPeer {
            let info = self.info(handle, EndReason::Local);
            self.route(handle, RelayCallback::Disconnected { conn: handle, info });

            let peer_open = self
                .links
                .get(&peer)
                .map(|p| p.state != LinkState::ClosedByPeer)
                .unwrap_or(false);
            if peer_open {
                if let Some(p) = self.links.get_mut(&peer) {
                    p.state = LinkState::ClosedByPeer;
                }
                let info = self.info(peer, EndReason::Remote);
                self.route(peer, RelayCallback::Disconnected { conn: peer, info });
            }
        }

        self.links.remove(&handle);
        true
    }
}

/// Shared hub that all loopback endpoints talk through
#[derive(Debug, Clone)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNetwork {
    /// Network assigning sequential handles starting at 1
    pub fn new() -> Self {
        Self::with_first_handle(1)
    }

    pub fn with_first_handle(first: u32) -> Self {
        LoopbackNetwork {
            state: Arc::new(Mutex::new(NetworkState {
                next_handle: first.max(1),
                next_socket: 1,
                random_handles: false,
                max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
                listeners: HashMap::new(),
                sockets: HashMap::new(),
                links: HashMap::new(),
            })),
        }
    }

    /// Network assigning random nonzero handles, like a real relay library
    pub fn with_random_handles() -> Self {
        let network = Self::new();
        network.lock().random_handles = true;
        network
    }

    /// Create the endpoint for one peer identity
    pub fn endpoint(&self, identity: RemoteIdentity) -> LoopbackProvider {
        LoopbackProvider {
            identity,
            network: self.clone(),
            app_id: None,
            relay_access: false,
            debug_level: DebugLevel::None,
            debug_output: Vec::new(),
        }
    }

    /// Number of connection handles not yet closed by their owner
    pub fn open_handles(&self) -> usize {
        self.lock().links.len()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One peer's view of the loopback network
#[derive(Debug)]
pub struct LoopbackProvider {
    identity: RemoteIdentity,
    network: LoopbackNetwork,
    app_id: Option<u32>,
    relay_access: bool,
    debug_level: DebugLevel,
    debug_output: Vec<DebugMessage>,
}

impl LoopbackProvider {
    pub fn identity(&self) -> RemoteIdentity {
        self.identity
    }

    pub fn app_id(&self) -> Option<u32> {
        self.app_id
    }

    pub fn relay_access(&self) -> bool {
        self.relay_access
    }

    fn diag(&mut self, level: DebugLevel, text: String) {
        if self.debug_level != DebugLevel::None && level <= self.debug_level {
            self.debug_output.push(DebugMessage { level, text });
        }
    }

    fn owned_link(
        state: &NetworkState,
        identity: RemoteIdentity,
        conn: ConnectionHandle,
    ) -> Result<&LinkEnd, ProviderError> {
        state
            .links
            .get(&conn)
            .filter(|end| end.owner == identity)
            .ok_or(ProviderError::InvalidHandle(conn))
    }
}

impl RelayProvider for LoopbackProvider {
    fn init_client(&mut self, app_id: u32) -> Result<(), ProviderError> {
        if app_id == 0 {
            return Err(ProviderError::Code(-1));
        }
        self.app_id = Some(app_id);
        Ok(())
    }

    fn run_callbacks(&mut self) {}

    fn shutdown(&mut self) {
        let mut state = self.network.lock();
        let owned: Vec<ConnectionHandle> = state
            .links
            .iter()
            .filter(|(_, end)| end.owner == self.identity)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in owned {
            state.close(handle);
        }
        state.sockets.retain(|_, socket| socket.owner != self.identity);
        state
            .listeners
            .retain(|(identity, _), _| *identity != self.identity);
        drop(state);

        self.app_id = None;
        self.relay_access = false;
    }

    fn init_relay_network_access(&mut self) {
        self.relay_access = true;
        self.diag(DebugLevel::Msg, "relay network access ready".to_string());
    }

    fn set_debug_output(&mut self, level: DebugLevel) {
        self.debug_level = level;
    }

    fn drain_debug_output(&mut self) -> Vec<DebugMessage> {
        std::mem::take(&mut self.debug_output)
    }

    fn connect_relay(
        &mut self,
        remote: RemoteIdentity,
        virtual_port: i32,
    ) -> Result<ConnectionHandle, ProviderError> {
        let mut state = self.network.lock();
        if !remote.is_valid() || !state.listeners.contains_key(&(remote, virtual_port)) {
            return Err(ProviderError::UnknownIdentity(remote));
        }
        let socket = state.listeners[&(remote, virtual_port)];

        let server_side = ConnectionHandle(state.alloc_handle());
        state.links.insert(
            server_side,
            LinkEnd {
                owner: remote,
                remote: self.identity,
                peer: ConnectionHandle(0),
                socket: Some(socket),
                state: LinkState::Connecting,
                queue: VecDeque::new(),
            },
        );
        let client_side = ConnectionHandle(state.alloc_handle());
        state.links.insert(
            client_side,
            LinkEnd {
                owner: self.identity,
                remote,
                peer: server_side,
                socket: None,
                state: LinkState::Connecting,
                queue: VecDeque::new(),
            },
        );
        if let Some(end) = state.links.get_mut(&server_side) {
            end.peer = client_side;
        }

        for handle in [client_side, server_side] {
            let info = state.info(handle, EndReason::None);
            state.route(handle, RelayCallback::Connecting { conn: handle, info });
        }
        drop(state);

        self.diag(
            DebugLevel::Verbose,
            format!("connecting {} to {} as {}", self.identity, remote, client_side),
        );
        Ok(client_side)
    }

    fn create_relay_socket(&mut self, virtual_port: i32) -> Result<ListenSocket, ProviderError> {
        let mut state = self.network.lock();
        if state.listeners.contains_key(&(self.identity, virtual_port)) {
            return Err(ProviderError::PortInUse(virtual_port));
        }
        let id = state.next_socket;
        state.next_socket += 1;
        state.sockets.insert(
            id,
            SocketEntry {
                owner: self.identity,
                virtual_port,
                queue: VecDeque::new(),
            },
        );
        state.listeners.insert((self.identity, virtual_port), id);
        drop(state);

        self.diag(
            DebugLevel::Msg,
            format!("listening on virtual port {}", virtual_port),
        );
        Ok(ListenSocket(id))
    }

    fn accept(&mut self, conn: ConnectionHandle) -> Result<(), ProviderError> {
        let mut state = self.network.lock();
        let end = Self::owned_link(&state, self.identity, conn)?;
        if end.state != LinkState::Connecting || end.socket.is_none() {
            return Err(ProviderError::NotConnected(conn));
        }
        let peer = end.peer;
        let peer_waiting = state
            .links
            .get(&peer)
            .map(|p| p.state == LinkState::Connecting)
            .unwrap_or(false);
        if !peer_waiting {
            return Err(ProviderError::NotConnected(conn));
        }

        for handle in [conn, peer] {
            if let Some(end) = state.links.get_mut(&handle) {
                end.state = LinkState::Connected;
            }
            let info = state.info(handle, EndReason::None);
            state.route(handle, RelayCallback::Connected { conn: handle, info });
        }
        drop(state);

        self.diag(DebugLevel::Verbose, format!("accepted {}", conn));
        Ok(())
    }

    fn close_connection(&mut self, conn: ConnectionHandle) {
        let mut state = self.network.lock();
        if Self::owned_link(&state, self.identity, conn).is_err() {
            return;
        }
        let closed = state.close(conn);
        drop(state);

        if closed {
            self.diag(DebugLevel::Verbose, format!("closed {}", conn));
        }
    }

    fn close_socket(&mut self, socket: ListenSocket) {
        let mut state = self.network.lock();
        let owned = state
            .sockets
            .get(&socket.0)
            .map(|s| s.owner == self.identity)
            .unwrap_or(false);
        if !owned {
            return;
        }
        let accepted: Vec<ConnectionHandle> = state
            .links
            .iter()
            .filter(|(_, end)| end.socket == Some(socket.0))
            .map(|(handle, _)| *handle)
            .collect();
        for handle in accepted {
            state.close(handle);
        }
        if let Some(entry) = state.sockets.remove(&socket.0) {
            state.listeners.remove(&(entry.owner, entry.virtual_port));
        }
    }

    fn send_message(
        &mut self,
        conn: ConnectionHandle,
        data: &[u8],
        flags: SendFlags,
    ) -> Result<(), ProviderError> {
        let mut state = self.network.lock();
        let end = Self::owned_link(&state, self.identity, conn)?;
        if end.state != LinkState::Connected {
            return Err(ProviderError::NotConnected(conn));
        }
        if data.len() > state.max_message_size {
            return Err(ProviderError::MessageTooLarge {
                size: data.len(),
                max: state.max_message_size,
            });
        }
        let peer = end.peer;

        if !state.links.contains_key(&peer) {
            return Err(ProviderError::NotConnected(conn));
        }
        let message = ReceivedMessage {
            data: Bytes::copy_from_slice(data),
        };
        state.route(peer, RelayCallback::Message { conn: peer, message });
        drop(state);

        self.diag(
            DebugLevel::Debug,
            format!("sent {} bytes on {} (flags {})", data.len(), conn, flags.bits()),
        );
        Ok(())
    }

    fn receive_on_connection(&mut self, conn: ConnectionHandle) -> Vec<RelayCallback> {
        let mut state = self.network.lock();
        match state.links.get_mut(&conn) {
            Some(end) if end.owner == self.identity => end.queue.drain(..).collect(),
            _ => Vec::new(),
        }
    }

    fn receive_on_socket(&mut self, socket: ListenSocket) -> Vec<RelayCallback> {
        let mut state = self.network.lock();
        match state.sockets.get_mut(&socket.0) {
            Some(entry) if entry.owner == self.identity => entry.queue.drain(..).collect(),
            _ => Vec::new(),
        }
    }
}
