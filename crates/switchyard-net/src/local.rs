//! The host-process loopback endpoint.
//!
//! A server embedded in a game client needs the host player on the wire
//! contract without a socket. The local endpoint reserves connection id 0
//! and keeps the external contract of a remote endpoint — connect and
//! disconnect events, `send` with the same size checks — but dispatches
//! immediately in-process instead of framing bytes onto a stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::NetError;
use crate::events::{LOCAL_CONNECTION_ID, NetEvent};
use crate::frame::FrameError;
use crate::server::Registry;

/// Registry-side half of the loopback: receives what the server sends to
/// connection id 0.
pub(crate) struct LocalPeer {
    connected: AtomicBool,
    max_message_size: usize,
    callback: Box<dyn Fn(u16, u16, Bytes) + Send + Sync>,
}

impl LocalPeer {
    pub(crate) fn new(
        max_message_size: usize,
        callback: impl Fn(u16, u16, Bytes) + Send + Sync + 'static,
    ) -> Self {
        Self {
            connected: AtomicBool::new(true),
            max_message_size,
            callback: Box::new(callback),
        }
    }

    /// Deliver a server-to-host message, synchronously.
    pub(crate) fn deliver(&self, protocol_id: u16, tag: u16, payload: &[u8]) -> Result<(), NetError> {
        if payload.len() > self.max_message_size {
            return Err(FrameError::MessageOverflow {
                size: payload.len(),
                max: self.max_message_size,
            }
            .into());
        }
        if !self.connected.load(Ordering::Acquire) {
            return Err(NetError::NotConnected);
        }
        (self.callback)(protocol_id, tag, Bytes::copy_from_slice(payload));
        Ok(())
    }

    pub(crate) fn mark_closed(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Host-side handle to the loopback connection.
///
/// Obtained from `NetServer::attach_local`. `send` injects a message into
/// the server's event stream as if it had arrived from connection id 0.
pub struct LocalEndpoint {
    registry: Arc<Registry>,
    events: mpsc::Sender<NetEvent>,
    peer: Arc<LocalPeer>,
    max_message_size: usize,
}

impl LocalEndpoint {
    pub(crate) fn new(
        registry: Arc<Registry>,
        events: mpsc::Sender<NetEvent>,
        peer: Arc<LocalPeer>,
        max_message_size: usize,
    ) -> Self {
        Self {
            registry,
            events,
            peer,
            max_message_size,
        }
    }

    /// Send a message from the host to the server.
    pub async fn send(&self, protocol_id: u16, tag: u16, payload: &[u8]) -> Result<(), NetError> {
        if payload.len() > self.max_message_size {
            return Err(FrameError::MessageOverflow {
                size: payload.len(),
                max: self.max_message_size,
            }
            .into());
        }
        if !self.peer.is_connected() {
            return Err(NetError::NotConnected);
        }
        self.events
            .send(NetEvent::Message {
                connection_id: LOCAL_CONNECTION_ID,
                protocol_id,
                tag,
                payload: Bytes::copy_from_slice(payload),
            })
            .await
            .map_err(|_| NetError::EventQueueClosed)
    }

    /// Detach from the server.
    ///
    /// Fires `ClientDisconnected` for id 0 with no error; errors with
    /// [`NetError::AlreadyClosed`] when already detached.
    pub async fn close(&self) -> Result<(), NetError> {
        self.registry.close_local().await
    }

    /// Whether the loopback is still attached.
    pub fn is_connected(&self) -> bool {
        self.peer.is_connected()
    }
}
