//! Transport Events
//!
//! Handlers translate provider callbacks into [`TransportEvent`]s and push
//! them into an [`EventQueue`]; the driver drains it with `poll_event` or
//! through a subscriber channel.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::connection::{Connection, Inbound};

/// Transport-level peer address. `ClientId::SERVER` is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl ClientId {
    /// Means "the server": clients address their only peer with it
    pub const SERVER: ClientId = ClientId(0);

    pub fn is_server(&self) -> bool {
        *self == ClientId::SERVER
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind tag of a transport event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum NetworkEvent {
    Data = 0,
    Connect = 1,
    Disconnect = 2,
    Nothing = 3,
}

/// Events emitted by the RelayTransport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Peer connection established
    Connect {
        client_id: ClientId,
        receive_time: Duration,
    },
    /// Peer connection closed
    Disconnect {
        client_id: ClientId,
        receive_time: Duration,
    },
    /// Data received from a peer
    Data {
        client_id: ClientId,
        payload: Bytes,
        receive_time: Duration,
    },
    /// Nothing pending
    Nothing { receive_time: Duration },
}

impl TransportEvent {
    pub fn kind(&self) -> NetworkEvent {
        match self {
            TransportEvent::Connect { .. } => NetworkEvent::Connect,
            TransportEvent::Disconnect { .. } => NetworkEvent::Disconnect,
            TransportEvent::Data { .. } => NetworkEvent::Data,
            TransportEvent::Nothing { .. } => NetworkEvent::Nothing,
        }
    }

    /// `ClientId::SERVER` for `Nothing`
    pub fn client_id(&self) -> ClientId {
        match self {
            TransportEvent::Connect { client_id, .. }
            | TransportEvent::Disconnect { client_id, .. }
            | TransportEvent::Data { client_id, .. } => *client_id,
            TransportEvent::Nothing { .. } => ClientId::SERVER,
        }
    }

    /// Empty for everything but `Data`
    pub fn payload(&self) -> &[u8] {
        match self {
            TransportEvent::Data { payload, .. } => payload,
            _ => &[],
        }
    }

    /// Time since the transport was created
    pub fn receive_time(&self) -> Duration {
        match self {
            TransportEvent::Connect { receive_time, .. }
            | TransportEvent::Disconnect { receive_time, .. }
            | TransportEvent::Data { receive_time, .. }
            | TransportEvent::Nothing { receive_time } => *receive_time,
        }
    }
}

/// Counters for traffic the transport handled or dropped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub sends_dropped: u64,
    pub oversized_dropped: u64,
    pub truncated: u64,
    pub connections_refused: u64,
}

/// Ordered sink for events produced during a pump
#[derive(Debug)]
pub struct EventQueue {
    started: Instant,
    pending: VecDeque<TransportEvent>,
    subscriber: Option<mpsc::UnboundedSender<TransportEvent>>,
    pub stats: TransportStats,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue {
            started: Instant::now(),
            pending: VecDeque::new(),
            subscriber: None,
            stats: TransportStats::default(),
        }
    }

    pub fn now(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn connect(&mut self, client_id: ClientId) {
        let receive_time = self.now();
        self.push(TransportEvent::Connect {
            client_id,
            receive_time,
        });
    }

    pub fn disconnect(&mut self, client_id: ClientId) {
        let receive_time = self.now();
        self.push(TransportEvent::Disconnect {
            client_id,
            receive_time,
        });
    }

    pub fn data(&mut self, client_id: ClientId, payload: Bytes) {
        let receive_time = self.now();
        self.stats.messages_received += 1;
        self.push(TransportEvent::Data {
            client_id,
            payload,
            receive_time,
        });
    }

    /// Copy a provider message through the connection's buffer and emit `Data`
    pub fn message(&mut self, client_id: ClientId, conn: &mut Connection, data: &[u8]) {
        match conn.receive(data) {
            None => {
                tracing::debug!(
                    "Dropping message for client {} in state {:?}",
                    client_id,
                    conn.state
                );
            }
            Some(Ok(Inbound::Whole(payload))) => self.data(client_id, payload),
            Some(Ok(Inbound::Truncated(payload))) => {
                tracing::warn!(
                    "Truncated {} byte message from client {} to {} bytes",
                    data.len(),
                    client_id,
                    payload.len()
                );
                self.stats.truncated += 1;
                self.data(client_id, payload);
            }
            Some(Err(e)) => {
                tracing::warn!("Rejected message from client {}: {}", client_id, e);
                self.stats.oversized_dropped += 1;
            }
        }
    }

    /// Route events to a channel instead of the poll queue
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriber = Some(tx);
        rx
    }

    fn push(&mut self, event: TransportEvent) {
        if let Some(tx) = &self.subscriber {
            match tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => {
                    tracing::debug!("Event subscriber dropped, falling back to polling");
                    self.subscriber = None;
                    self.pending.push_back(event);
                    return;
                }
            }
        }
        self.pending.push_back(event);
    }

    /// Next event, or `Nothing` when the queue is empty
    pub fn pop(&mut self) -> TransportEvent {
        match self.pending.pop_front() {
            Some(event) => event,
            None => TransportEvent::Nothing {
                receive_time: self.now(),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Drop queued events and detach the subscriber
    pub fn reset(&mut self) {
        self.pending.clear();
        self.subscriber = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_order_and_nothing() {
        let mut queue = EventQueue::new();
        queue.connect(ClientId(7));
        queue.data(ClientId(7), Bytes::from_static(&[1, 2, 3]));
        queue.disconnect(ClientId(7));

        let first = queue.pop();
        assert_eq!(first.kind(), NetworkEvent::Connect);
        assert_eq!(first.client_id(), ClientId(7));

        let second = queue.pop();
        assert_eq!(second.kind(), NetworkEvent::Data);
        assert_eq!(second.payload(), &[1, 2, 3]);
        assert!(second.receive_time() >= first.receive_time());

        assert_eq!(queue.pop().kind(), NetworkEvent::Disconnect);
        let empty = queue.pop();
        assert_eq!(empty.kind(), NetworkEvent::Nothing);
        assert!(empty.client_id().is_server());
        assert!(empty.payload().is_empty());
        assert_eq!(queue.stats.messages_received, 1);
    }

    #[test]
    fn test_message_respects_connection_state_and_limit() {
        use crate::config::OversizedPolicy;
        use crate::relay::ConnectionHandle;

        let mut queue = EventQueue::new();
        let mut conn = Connection::new(ConnectionHandle(5), 4, OversizedPolicy::Reject);

        queue.message(ClientId(5), &mut conn, b"hi");
        assert!(queue.is_empty());

        conn.mark_connected();
        queue.message(ClientId(5), &mut conn, b"hi");
        queue.message(ClientId(5), &mut conn, b"too long");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().payload(), b"hi");
        assert_eq!(queue.stats.oversized_dropped, 1);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let mut queue = EventQueue::new();
        let mut rx = queue.subscribe();
        queue.connect(ClientId::SERVER);

        let event = rx.recv().await.expect("event");
        assert_eq!(event.kind(), NetworkEvent::Connect);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reset_detaches_subscriber() {
        let mut queue = EventQueue::new();
        let mut rx = queue.subscribe();
        queue.connect(ClientId(4));
        queue.reset();

        queue.connect(ClientId(5));
        assert_eq!(queue.pop().client_id(), ClientId(5));
        assert_eq!(rx.try_recv().map(|e| e.client_id()), Ok(ClientId(4)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscriber_falls_back_to_queue() {
        let mut queue = EventQueue::new();
        let rx = queue.subscribe();
        drop(rx);

        queue.disconnect(ClientId(3));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().client_id(), ClientId(3));
    }
}
