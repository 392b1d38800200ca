//! Connection State Management
//!
//! Manages the lifecycle and receive buffer of one relay connection.

use bytes::{Bytes, BytesMut};

use crate::config::OversizedPolicy;
use crate::error::TransportError;
use crate::relay::ConnectionHandle;

/// Connection state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Request issued, waiting for the provider
    Connecting,
    /// Established, data may flow
    Connected,
    /// Close requested locally, waiting for the provider to confirm
    Closing,
    /// Terminated
    Disconnected,
}

/// Payload copied out of a receive buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Whole(Bytes),
    /// Cut down to the buffer capacity
    Truncated(Bytes),
}

impl Inbound {
    pub fn into_payload(self) -> Bytes {
        match self {
            Inbound::Whole(payload) | Inbound::Truncated(payload) => payload,
        }
    }
}

/// Bounded per-connection receive buffer
#[derive(Debug)]
pub struct ReceiveBuffer {
    buf: BytesMut,
    max: usize,
    policy: OversizedPolicy,
}

impl ReceiveBuffer {
    pub fn new(max: usize, policy: OversizedPolicy) -> Self {
        ReceiveBuffer {
            buf: BytesMut::new(),
            max,
            policy,
        }
    }

    /// Copy a provider message into an owned payload, enforcing the size limit
    pub fn copy_in(&mut self, data: &[u8]) -> Result<Inbound, TransportError> {
        if data.len() <= self.max {
            self.buf.extend_from_slice(data);
            return Ok(Inbound::Whole(self.buf.split().freeze()));
        }
        match self.policy {
            OversizedPolicy::Reject => Err(TransportError::MessageTooLarge {
                size: data.len(),
                max: self.max,
            }),
            OversizedPolicy::Truncate => {
                self.buf.extend_from_slice(&data[..self.max]);
                Ok(Inbound::Truncated(self.buf.split().freeze()))
            }
        }
    }
}

/// Represents a single relay connection
#[derive(Debug)]
pub struct Connection {
    pub handle: ConnectionHandle,
    pub state: ConnectionState,
    pub buffer: ReceiveBuffer,
}

impl Connection {
    pub fn new(handle: ConnectionHandle, max_message_size: usize, policy: OversizedPolicy) -> Self {
        Connection {
            handle,
            state: ConnectionState::Connecting,
            buffer: ReceiveBuffer::new(max_message_size, policy),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Move to `Connected`. Returns false if the connection already left `Connecting`.
    pub fn mark_connected(&mut self) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Connected;
        true
    }

    /// Move to `Disconnected`. Returns false if it was already there.
    pub fn mark_disconnected(&mut self) -> bool {
        if self.state == ConnectionState::Disconnected {
            return false;
        }
        self.state = ConnectionState::Disconnected;
        true
    }

    /// Accept an inbound message. Only connected connections produce data.
    pub fn receive(&mut self, data: &[u8]) -> Option<Result<Inbound, TransportError>> {
        if !self.is_connected() {
            return None;
        }
        Some(self.buffer.copy_in(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_lifecycle() {
        let mut conn = Connection::new(ConnectionHandle(12345), 16, OversizedPolicy::Reject);

        assert_eq!(conn.state, ConnectionState::Connecting);
        assert!(conn.receive(b"too early").is_none());

        assert!(conn.mark_connected());
        assert!(!conn.mark_connected());
        let payload = conn.receive(b"hello").unwrap().unwrap();
        assert_eq!(payload, Inbound::Whole(Bytes::from_static(b"hello")));

        assert!(conn.mark_disconnected());
        assert!(!conn.mark_disconnected());
        assert!(conn.receive(b"too late").is_none());
    }

    #[test]
    fn test_oversized_rejected() {
        let mut buffer = ReceiveBuffer::new(4, OversizedPolicy::Reject);
        assert_eq!(
            buffer.copy_in(&[0u8; 5]),
            Err(TransportError::MessageTooLarge { size: 5, max: 4 })
        );
        // Buffer is still usable afterwards
        assert_eq!(
            buffer.copy_in(&[1, 2, 3, 4]).unwrap(),
            Inbound::Whole(Bytes::from_static(&[1, 2, 3, 4]))
        );
    }

    #[test]
    fn test_oversized_truncated() {
        let mut buffer = ReceiveBuffer::new(3, OversizedPolicy::Truncate);
        let inbound = buffer.copy_in(&[9, 8, 7, 6, 5]).unwrap();
        assert_eq!(inbound, Inbound::Truncated(Bytes::from_static(&[9, 8, 7])));
        assert_eq!(inbound.into_payload().len(), 3);
    }

    #[test]
    fn test_payloads_do_not_alias() {
        let mut buffer = ReceiveBuffer::new(8, OversizedPolicy::Reject);
        let first = buffer.copy_in(b"aaaa").unwrap().into_payload();
        let second = buffer.copy_in(b"bbbb").unwrap().into_payload();
        assert_eq!(&first[..], b"aaaa");
        assert_eq!(&second[..], b"bbbb");
    }
}
