//! Transport-level error types.

use crate::events::ConnectionId;
use crate::frame::FrameError;

/// Errors raised by endpoints and the server registry.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The endpoint cannot accept sends (never connected, or shut down).
    #[error("endpoint is not connected")]
    NotConnected,

    /// `close` was called on an endpoint that is already closed.
    #[error("endpoint is already closed")]
    AlreadyClosed,

    /// `start` was called while the accept loop is running.
    #[error("server is already running")]
    AlreadyRunning,

    /// `stop` was called while the server is not running.
    #[error("server is not running")]
    NotRunning,

    /// No endpoint is registered under the given connection id.
    #[error("no client registered under {0:?}")]
    UnknownClient(ConnectionId),

    /// A local loopback endpoint is already attached.
    #[error("local endpoint is already attached")]
    LocalAlreadyAttached,

    /// The application dropped the event receiver.
    #[error("event queue closed")]
    EventQueueClosed,

    /// A framing-level failure.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
