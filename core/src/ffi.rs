//! FFI Module - C-ABI exports for engine integration
//!
//! A managed host (for example a C# game engine that binds the real relay
//! SDK) supplies the relay operations as a table of function pointers and
//! reports relay callbacks with `relay_transport_push_callback`. The core
//! runs the connection state machine and hands back transport events.
#![allow(clippy::not_unsafe_ptr_arg_deref)]

use std::collections::{HashSet, VecDeque};
use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::ptr;

use bytes::Bytes;

use crate::config::TransportConfig;
use crate::error::ProviderError;
use crate::relay::{
    ConnectionHandle, ConnectionInfo, DebugLevel, EndReason, ListenSocket, ReceivedMessage,
    RelayCallback, RelayProvider, RemoteIdentity,
};
use crate::transport::{ClientId, NetworkDelivery, RelayTransport, SendFlags, TransportEvent};

/// Relay operations implemented by the host. Return codes: 0 = success.
/// Missing entries are treated as failing (or no-op for void calls).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FfiRelayVTable {
    pub user_data: *mut c_void,
    pub init_client: Option<extern "C" fn(*mut c_void, u32) -> i32>,
    pub run_callbacks: Option<extern "C" fn(*mut c_void)>,
    pub shutdown: Option<extern "C" fn(*mut c_void)>,
    pub init_relay_network_access: Option<extern "C" fn(*mut c_void)>,
    pub set_debug_output: Option<extern "C" fn(*mut c_void, i32)>,
    pub connect_relay: Option<extern "C" fn(*mut c_void, u64, i32, *mut u32) -> i32>,
    pub create_relay_socket: Option<extern "C" fn(*mut c_void, i32, *mut u32) -> i32>,
    pub accept: Option<extern "C" fn(*mut c_void, u32) -> i32>,
    pub close_connection: Option<extern "C" fn(*mut c_void, u32)>,
    pub close_socket: Option<extern "C" fn(*mut c_void, u32)>,
    pub send_message: Option<extern "C" fn(*mut c_void, u32, *const u8, usize, i32) -> i32>,
}

const MISSING_ENTRY: i32 = -100;

fn check(code: i32) -> Result<(), ProviderError> {
    if code == 0 {
        Ok(())
    } else {
        Err(ProviderError::Code(code))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Connection(ConnectionHandle),
    Socket(ListenSocket),
}

/// Provider backed by host function pointers and host-pushed callbacks.
/// Only targets handed out by this provider and not yet closed can queue
/// callbacks.
pub struct FfiProvider {
    vtable: FfiRelayVTable,
    pending: VecDeque<(Target, RelayCallback)>,
    connections: HashSet<ConnectionHandle>,
    sockets: HashSet<ListenSocket>,
}

impl FfiProvider {
    pub fn new(vtable: FfiRelayVTable) -> Self {
        FfiProvider {
            vtable,
            pending: VecDeque::new(),
            connections: HashSet::new(),
            sockets: HashSet::new(),
        }
    }

    /// Callbacks waiting to be drained
    pub fn pending_callbacks(&self) -> usize {
        self.pending.len()
    }

    fn is_live(&self, target: Target) -> bool {
        match target {
            Target::Connection(conn) => self.connections.contains(&conn),
            Target::Socket(socket) => self.sockets.contains(&socket),
        }
    }

    /// Queue a callback reported by the host. Returns false for closed or
    /// unknown targets.
    fn push(&mut self, socket: u32, callback: RelayCallback) -> bool {
        let target = if socket == 0 {
            Target::Connection(callback.connection())
        } else {
            Target::Socket(ListenSocket(socket))
        };
        if !self.is_live(target) {
            tracing::debug!("Dropping callback for unknown target {:?}", target);
            return false;
        }
        self.pending.push_back((target, callback));
        true
    }

    /// Take the callbacks for `target`, discarding any whose target closed
    fn drain(&mut self, target: Target) -> Vec<RelayCallback> {
        let mut matched = Vec::new();
        let mut rest = VecDeque::with_capacity(self.pending.len());
        for (t, callback) in std::mem::take(&mut self.pending) {
            if t == target {
                matched.push(callback);
            } else if self.is_live(t) {
                rest.push_back((t, callback));
            }
        }
        self.pending = rest;
        matched
    }

    fn forget(&mut self, target: Target) {
        match target {
            Target::Connection(conn) => self.connections.remove(&conn),
            Target::Socket(socket) => self.sockets.remove(&socket),
        };
        self.pending.retain(|(t, _)| *t != target);
    }
}

impl RelayProvider for FfiProvider {
    fn init_client(&mut self, app_id: u32) -> Result<(), ProviderError> {
        let f = self.vtable.init_client.ok_or(ProviderError::Code(MISSING_ENTRY))?;
        check(f(self.vtable.user_data, app_id))
    }

    fn run_callbacks(&mut self) {
        if let Some(f) = self.vtable.run_callbacks {
            f(self.vtable.user_data);
        }
    }

    fn shutdown(&mut self) {
        self.pending.clear();
        self.connections.clear();
        self.sockets.clear();
        if let Some(f) = self.vtable.shutdown {
            f(self.vtable.user_data);
        }
    }

    fn init_relay_network_access(&mut self) {
        if let Some(f) = self.vtable.init_relay_network_access {
            f(self.vtable.user_data);
        }
    }

    fn set_debug_output(&mut self, level: DebugLevel) {
        if let Some(f) = self.vtable.set_debug_output {
            f(self.vtable.user_data, level as i32);
        }
    }

    fn connect_relay(
        &mut self,
        remote: RemoteIdentity,
        virtual_port: i32,
    ) -> Result<ConnectionHandle, ProviderError> {
        let f = self.vtable.connect_relay.ok_or(ProviderError::Code(MISSING_ENTRY))?;
        let mut handle = 0u32;
        check(f(self.vtable.user_data, remote.0, virtual_port, &mut handle))?;
        self.connections.insert(ConnectionHandle(handle));
        Ok(ConnectionHandle(handle))
    }

    fn create_relay_socket(&mut self, virtual_port: i32) -> Result<ListenSocket, ProviderError> {
        let f = self
            .vtable
            .create_relay_socket
            .ok_or(ProviderError::Code(MISSING_ENTRY))?;
        let mut socket = 0u32;
        check(f(self.vtable.user_data, virtual_port, &mut socket))?;
        self.sockets.insert(ListenSocket(socket));
        Ok(ListenSocket(socket))
    }

    fn accept(&mut self, conn: ConnectionHandle) -> Result<(), ProviderError> {
        let f = self.vtable.accept.ok_or(ProviderError::Code(MISSING_ENTRY))?;
        check(f(self.vtable.user_data, conn.0))
    }

    fn close_connection(&mut self, conn: ConnectionHandle) {
        self.forget(Target::Connection(conn));
        if let Some(f) = self.vtable.close_connection {
            f(self.vtable.user_data, conn.0);
        }
    }

    fn close_socket(&mut self, socket: ListenSocket) {
        self.forget(Target::Socket(socket));
        if let Some(f) = self.vtable.close_socket {
            f(self.vtable.user_data, socket.0);
        }
    }

    fn send_message(
        &mut self,
        conn: ConnectionHandle,
        data: &[u8],
        flags: SendFlags,
    ) -> Result<(), ProviderError> {
        let f = self.vtable.send_message.ok_or(ProviderError::Code(MISSING_ENTRY))?;
        check(f(
            self.vtable.user_data,
            conn.0,
            data.as_ptr(),
            data.len(),
            flags.bits(),
        ))
    }

    fn receive_on_connection(&mut self, conn: ConnectionHandle) -> Vec<RelayCallback> {
        self.drain(Target::Connection(conn))
    }

    fn receive_on_socket(&mut self, socket: ListenSocket) -> Vec<RelayCallback> {
        self.drain(Target::Socket(socket))
    }
}

/// Opaque handle to a transport
pub struct FfiTransport {
    transport: RelayTransport<FfiProvider>,
    /// Keeps the payload of the last polled event alive for the host
    last_event: Option<TransportEvent>,
}

/// Transport event for FFI. `payload` stays valid until the next poll.
#[repr(C)]
pub struct FfiTransportEvent {
    pub kind: i32, // 0=Data, 1=Connect, 2=Disconnect, 3=Nothing
    pub client_id: u64,
    pub payload: *const u8,
    pub payload_len: usize,
    pub receive_time: f32,
}

/// Create a transport. `config_json` may be null for defaults.
/// Returns null on error; free with `relay_transport_destroy`.
#[no_mangle]
pub extern "C" fn relay_transport_create(
    vtable: *const FfiRelayVTable,
    config_json: *const c_char,
) -> *mut FfiTransport {
    if vtable.is_null() {
        return ptr::null_mut();
    }
    let vtable = unsafe { *vtable };

    let config = if config_json.is_null() {
        TransportConfig::default()
    } else {
        let json = unsafe { CStr::from_ptr(config_json) }.to_string_lossy();
        match TransportConfig::from_json_str(&json) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse transport config: {:#}", e);
                return ptr::null_mut();
            }
        }
    };

    let handle = Box::new(FfiTransport {
        transport: RelayTransport::new(FfiProvider::new(vtable), config),
        last_event: None,
    });
    Box::into_raw(handle)
}

/// Destroy a transport handle (shuts it down first)
#[no_mangle]
pub extern "C" fn relay_transport_destroy(handle: *mut FfiTransport) {
    if !handle.is_null() {
        unsafe {
            let mut handle = Box::from_raw(handle);
            handle.transport.shutdown();
        }
    }
}

#[no_mangle]
pub extern "C" fn relay_transport_initialize(handle: *mut FfiTransport) {
    if handle.is_null() {
        return;
    }
    let handle = unsafe { &mut *handle };
    handle.transport.initialize();
}

/// Returns 0 on success, -1 on error
#[no_mangle]
pub extern "C" fn relay_transport_start_client(handle: *mut FfiTransport, remote: u64) -> i32 {
    if handle.is_null() {
        return -1;
    }
    let handle = unsafe { &mut *handle };
    match handle.transport.start_client(RemoteIdentity(remote)) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Returns 0 on success, -1 on error
#[no_mangle]
pub extern "C" fn relay_transport_start_server(handle: *mut FfiTransport) -> i32 {
    if handle.is_null() {
        return -1;
    }
    let handle = unsafe { &mut *handle };
    match handle.transport.start_server() {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Returns 1 if handed to the relay, 0 if dropped, -1 on bad arguments
#[no_mangle]
pub extern "C" fn relay_transport_send(
    handle: *mut FfiTransport,
    client_id: u64,
    data: *const u8,
    len: usize,
    delivery: i32,
) -> i32 {
    if handle.is_null() || (data.is_null() && len > 0) {
        return -1;
    }
    let handle = unsafe { &mut *handle };
    let payload: &[u8] = if len == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(data, len) }
    };
    let outcome = handle.transport.send(
        ClientId(client_id),
        payload,
        NetworkDelivery::from_raw(delivery),
    );
    i32::from(outcome.is_sent())
}

/// Report a relay callback.
/// kind: 0=Connecting, 1=Connected, 2=Disconnected, 3=Message
/// socket: listen socket the connection belongs to, 0 for a client connection
/// end_reason: 0=None, 1=Local, 2=Remote, other=Problem
/// Returns 0 on success, -1 on bad arguments or a connection/socket that is
/// not open
#[no_mangle]
pub extern "C" fn relay_transport_push_callback(
    handle: *mut FfiTransport,
    kind: i32,
    socket: u32,
    conn: u32,
    remote: u64,
    end_reason: i32,
    data: *const u8,
    len: usize,
) -> i32 {
    if handle.is_null() || (data.is_null() && len > 0) {
        return -1;
    }
    let handle = unsafe { &mut *handle };
    let conn = ConnectionHandle(conn);
    let info = ConnectionInfo {
        remote: RemoteIdentity(remote),
        end_reason: match end_reason {
            0 => EndReason::None,
            1 => EndReason::Local,
            2 => EndReason::Remote,
            _ => EndReason::Problem,
        },
    };

    let callback = match kind {
        0 => RelayCallback::Connecting { conn, info },
        1 => RelayCallback::Connected { conn, info },
        2 => RelayCallback::Disconnected { conn, info },
        3 => {
            let data = if len == 0 {
                Bytes::new()
            } else {
                Bytes::copy_from_slice(unsafe { std::slice::from_raw_parts(data, len) })
            };
            RelayCallback::Message {
                conn,
                message: ReceivedMessage { data },
            }
        }
        _ => return -1,
    };
    if handle.transport.provider_mut().push(socket, callback) {
        0
    } else {
        -1
    }
}

#[no_mangle]
pub extern "C" fn relay_transport_pump(handle: *mut FfiTransport) {
    if handle.is_null() {
        return;
    }
    let handle = unsafe { &mut *handle };
    handle.transport.pump();
}

/// Poll the next event into `out`. Returns the event kind, or -1 on bad arguments.
#[no_mangle]
pub extern "C" fn relay_transport_poll_event(
    handle: *mut FfiTransport,
    out: *mut FfiTransportEvent,
) -> i32 {
    if handle.is_null() || out.is_null() {
        return -1;
    }
    let handle = unsafe { &mut *handle };
    let event = handle.transport.poll_event();

    let kind = event.kind() as i32;
    let client_id = event.client_id().0;
    let receive_time = event.receive_time().as_secs_f32();
    let stored = handle.last_event.insert(event);
    let payload = stored.payload();

    unsafe {
        *out = FfiTransportEvent {
            kind,
            client_id,
            payload: if payload.is_empty() {
                ptr::null()
            } else {
                payload.as_ptr()
            },
            payload_len: payload.len(),
            receive_time,
        };
    }
    kind
}

#[no_mangle]
pub extern "C" fn relay_transport_disconnect_remote_client(
    handle: *mut FfiTransport,
    client_id: u64,
) {
    if handle.is_null() {
        return;
    }
    let handle = unsafe { &mut *handle };
    handle.transport.disconnect_remote_client(ClientId(client_id));
}

#[no_mangle]
pub extern "C" fn relay_transport_disconnect_local_client(handle: *mut FfiTransport) {
    if handle.is_null() {
        return;
    }
    let handle = unsafe { &mut *handle };
    handle.transport.disconnect_local_client();
}

/// Round trip time in milliseconds (not tracked, always 0)
#[no_mangle]
pub extern "C" fn relay_transport_get_current_rtt(
    handle: *const FfiTransport,
    client_id: u64,
) -> u64 {
    if handle.is_null() {
        return 0;
    }
    let handle = unsafe { &*handle };
    handle
        .transport
        .get_current_rtt(ClientId(client_id))
        .as_millis() as u64
}

#[no_mangle]
pub extern "C" fn relay_transport_shutdown(handle: *mut FfiTransport) {
    if handle.is_null() {
        return;
    }
    let handle = unsafe { &mut *handle };
    handle.transport.shutdown();
    handle.last_event = None;
}
