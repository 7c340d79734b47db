//! Transport events and the channel that serializes their delivery.
//!
//! Every endpoint and the accept loop push [`NetEvent`]s into one bounded
//! [`tokio::sync::mpsc`] channel. A single consumer drains it, so
//! application handlers never run concurrently with each other, and events
//! for one connection arrive in wire order.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::NetError;

/// Unique identifier for a connection within a server session.
///
/// Id 0 is reserved for the host-process loopback endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Reserved id of the local loopback endpoint.
pub const LOCAL_CONNECTION_ID: ConnectionId = ConnectionId(0);

/// A transport-level event delivered to the embedding application.
#[derive(Debug)]
pub enum NetEvent {
    /// The accept loop is up and listening.
    ServerStarted,
    /// A connection was accepted and registered (fired once per connection).
    ClientConnected(ConnectionId),
    /// A complete frame arrived on a connection.
    Message {
        /// Source connection.
        connection_id: ConnectionId,
        /// Protocol the message belongs to.
        protocol_id: u16,
        /// Message tag within the protocol.
        tag: u16,
        /// The frame payload, fully read off the wire.
        payload: Bytes,
    },
    /// A connection ended (fired once per connection).
    ///
    /// `error` is `None` for a graceful local close and populated for every
    /// abnormal cause (peer reset, framing violation, I/O failure).
    ClientDisconnected {
        /// The connection that ended.
        connection_id: ConnectionId,
        /// The cause, if abnormal.
        error: Option<NetError>,
    },
    /// The accept loop exited; `None` means an explicit stop.
    ServerStopped {
        /// The cause, if abnormal.
        error: Option<NetError>,
    },
}

/// Create the event channel pair.
///
/// The bounded depth is the inbound backpressure limit: reader tasks stall
/// once the application falls this far behind.
pub fn event_channel(depth: usize) -> (mpsc::Sender<NetEvent>, mpsc::Receiver<NetEvent>) {
    mpsc::channel(depth)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_send_order() {
        let (tx, mut rx) = event_channel(8);
        tx.send(NetEvent::ClientConnected(ConnectionId(1)))
            .await
            .unwrap();
        tx.send(NetEvent::Message {
            connection_id: ConnectionId(1),
            protocol_id: 0,
            tag: 4,
            payload: Bytes::from_static(b"x"),
        })
        .await
        .unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(NetEvent::ClientConnected(ConnectionId(1)))
        ));
        assert!(matches!(
            rx.recv().await,
            Some(NetEvent::Message { tag: 4, .. })
        ));
    }

    #[test]
    fn test_local_id_is_zero() {
        assert_eq!(LOCAL_CONNECTION_ID, ConnectionId(0));
    }
}
