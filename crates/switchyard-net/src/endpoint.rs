//! One connection: socket ownership, the life-cycle tasks, and `send`.
//!
//! An [`Endpoint`] takes exclusive ownership of its TCP stream at
//! construction and splits it between two tasks: a reader that pulls frames
//! off the wire (header, then payload) and delivers them as events, and a
//! writer that is the sole flusher of the outbound train buffer. `send`
//! returns once a frame is aboard the train, not once it is physically
//! written; the fair lock queue in front of the buffer keeps concurrent
//! senders in FIFO order.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc};

use crate::error::NetError;
use crate::events::{ConnectionId, NetEvent};
use crate::frame::{FrameError, FrameHeader, HEADER_SIZE};
use crate::train::{FlushReason, TrainBuffer};

/// Per-connection tuning, agreed out of band with the peer.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Payload size ceiling in bytes. Default: 4096.
    pub max_message_size: usize,
    /// How long a partially-filled train waits for more frames. Default: 500 ms.
    pub boarding_time: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: 4096,
            boarding_time: Duration::from_millis(500),
        }
    }
}

/// Flags and wakeups shared between the handle and the life-cycle tasks.
struct Shared {
    /// Accepting sends.
    connected: AtomicBool,
    /// Life-cycle tasks still running.
    active: AtomicBool,
    /// `close` was called, or the life-cycle already ended.
    closed: AtomicBool,
    /// Signalled after every train departure.
    drained: Notify,
}

/// Handle to one live connection.
///
/// Cheap to share behind an [`Arc`]; the socket itself lives inside the
/// life-cycle future returned by [`Endpoint::from_stream`].
pub struct Endpoint {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    max_message_size: usize,
    train: Arc<Mutex<TrainBuffer>>,
    flush_tx: mpsc::UnboundedSender<FlushReason>,
    shared: Arc<Shared>,
}

impl Endpoint {
    /// Wrap an established stream.
    ///
    /// Consumes the socket (a stream can never be wrapped twice) and returns
    /// the handle plus the life-cycle future. The caller spawns the future;
    /// it resolves when the connection ends, yielding the abnormal cause or
    /// `None` for a graceful local close. `ClientConnected` is emitted as the
    /// life-cycle's first act; emitting `ClientDisconnected` is the
    /// spawner's job, after any registry cleanup.
    pub fn from_stream(
        id: ConnectionId,
        stream: TcpStream,
        config: &TransportConfig,
        events: mpsc::Sender<NetEvent>,
    ) -> std::io::Result<(Self, impl Future<Output = Option<NetError>> + Send + 'static)> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();

        let train = Arc::new(Mutex::new(TrainBuffer::for_message_size(
            config.max_message_size,
        )));
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(true),
            active: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            drained: Notify::new(),
        });

        let endpoint = Self {
            id,
            peer_addr,
            max_message_size: config.max_message_size,
            train: Arc::clone(&train),
            flush_tx,
            shared: Arc::clone(&shared),
        };

        let max_message_size = config.max_message_size;
        let boarding_time = config.boarding_time;
        let lifecycle = async move {
            let _ = events.send(NetEvent::ClientConnected(id)).await;
            let result = tokio::select! {
                r = read_loop(read_half, id, max_message_size, events.clone()) => r,
                w = write_loop(write_half, Arc::clone(&train), flush_rx, Arc::clone(&shared), boarding_time) => w,
            };
            shared.connected.store(false, Ordering::Release);
            shared.active.store(false, Ordering::Release);
            shared.closed.store(true, Ordering::Release);
            shared.drained.notify_waiters();
            tracing::debug!(?id, error = ?result, "connection ended");
            result
        };

        Ok((endpoint, lifecycle))
    }

    /// Connect out to `addr` and spawn the life-cycle.
    ///
    /// The client-side mirror of the server's accept path; `id` names the
    /// peer in this side's events.
    pub async fn connect(
        addr: SocketAddr,
        id: ConnectionId,
        config: &TransportConfig,
        events: mpsc::Sender<NetEvent>,
    ) -> Result<Self, NetError> {
        let stream = TcpStream::connect(addr).await?;
        let (endpoint, lifecycle) = Self::from_stream(id, stream, config, events.clone())?;
        tokio::spawn(async move {
            let error = lifecycle.await;
            let _ = events
                .send(NetEvent::ClientDisconnected {
                    connection_id: id,
                    error,
                })
                .await;
        });
        Ok(endpoint)
    }

    /// This connection's id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The remote address, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Whether the endpoint accepts sends.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Whether the life-cycle tasks are still running.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Board a frame onto the outbound train.
    ///
    /// Returns once the frame is in the buffer. Frames from concurrent
    /// callers depart in the order the callers reached the buffer lock
    /// (the lock is fair, so that order is arrival order).
    pub async fn send(&self, protocol_id: u16, tag: u16, payload: &[u8]) -> Result<(), NetError> {
        if payload.len() > self.max_message_size {
            return Err(FrameError::MessageOverflow {
                size: payload.len(),
                max: self.max_message_size,
            }
            .into());
        }
        if !self.is_connected() {
            return Err(NetError::NotConnected);
        }
        let header = FrameHeader::new(protocol_id, tag, payload.len() as u16);

        loop {
            let mut train = self.train.lock().await;
            if !self.is_connected() {
                return Err(NetError::NotConnected);
            }
            if !train.would_overflow(payload.len()) {
                train.append(&header, payload)?;
                let boarded_empty = train.len() == HEADER_SIZE + payload.len();
                let flush_now = train.should_flush_now();
                drop(train);
                if flush_now {
                    self.request_flush(FlushReason::Threshold)?;
                } else if boarded_empty {
                    self.request_flush(FlushReason::Boarding)?;
                }
                return Ok(());
            }

            // Full train: request an immediate departure, then wait for the
            // writer to drain before trying to board again.
            self.request_flush(FlushReason::Threshold)?;
            let drained = self.shared.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            drop(train);
            drained.await;
        }
    }

    /// Request a graceful shutdown.
    ///
    /// Frames already aboard the train are flushed before the socket is shut
    /// down. Errors with [`NetError::AlreadyClosed`] when called twice or
    /// after the connection already ended.
    pub fn close(&self) -> Result<(), NetError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Err(NetError::AlreadyClosed);
        }
        self.shared.connected.store(false, Ordering::Release);
        let _ = self.flush_tx.send(FlushReason::Shutdown);
        Ok(())
    }

    fn request_flush(&self, reason: FlushReason) -> Result<(), NetError> {
        self.flush_tx
            .send(reason)
            .map_err(|_| NetError::NotConnected)
    }
}

/// Pull frames off the wire and deliver them as events, in arrival order.
async fn read_loop<R>(
    mut reader: R,
    id: ConnectionId,
    max_message_size: usize,
    events: mpsc::Sender<NetEvent>,
) -> Option<NetError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut head = [0u8; HEADER_SIZE];
        if let Some(err) = read_exact_or_close(&mut reader, &mut head).await {
            return Some(err);
        }
        let header = FrameHeader::decode(head);
        if let Err(e) = header.validate(max_message_size) {
            tracing::warn!(?id, %e, "terminating connection");
            return Some(e.into());
        }

        let mut payload = vec![0u8; usize::from(header.payload_len)];
        if !payload.is_empty() {
            if let Some(err) = read_exact_or_close(&mut reader, &mut payload).await {
                return Some(err);
            }
        }

        tracing::trace!(
            ?id,
            protocol_id = header.protocol_id,
            tag = header.tag,
            len = header.payload_len,
            "frame received"
        );

        // One in-flight inbound message at a time: the bounded event queue
        // admits the next frame only after the consumer makes room.
        let delivered = events
            .send(NetEvent::Message {
                connection_id: id,
                protocol_id: header.protocol_id,
                tag: header.tag,
                payload: Bytes::from(payload),
            })
            .await;
        if delivered.is_err() {
            return Some(NetError::EventQueueClosed);
        }
    }
}

async fn read_exact_or_close<R>(reader: &mut R, buf: &mut [u8]) -> Option<NetError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => None,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Some(FrameError::ConnectionClosed.into())
        }
        Err(e) => Some(NetError::Io(e)),
    }
}

/// The sole flusher: reacts to departure requests and the boarding window.
async fn write_loop<W>(
    mut writer: W,
    train: Arc<Mutex<TrainBuffer>>,
    mut flush_rx: mpsc::UnboundedReceiver<FlushReason>,
    shared: Arc<Shared>,
    boarding_time: Duration,
) -> Option<NetError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let mut reason = match flush_rx.recv().await {
            Some(r) => r,
            None => FlushReason::Shutdown,
        };

        if reason == FlushReason::Boarding {
            // Hold the departure for the boarding window; a threshold
            // crossing or shutdown during the window departs immediately.
            let window = tokio::time::sleep(boarding_time);
            tokio::pin!(window);
            loop {
                tokio::select! {
                    () = &mut window => break,
                    more = flush_rx.recv() => match more {
                        Some(FlushReason::Boarding) => continue,
                        Some(r) => {
                            reason = r;
                            break;
                        }
                        None => {
                            reason = FlushReason::Shutdown;
                            break;
                        }
                    },
                }
            }
        }

        let departing = train.lock().await.take();
        if !departing.is_empty() {
            if let Err(e) = writer.write_all(&departing).await {
                return Some(NetError::Io(e));
            }
            if let Err(e) = writer.flush().await {
                return Some(NetError::Io(e));
            }
            tracing::trace!(len = departing.len(), "train flushed");
        }
        shared.drained.notify_waiters();

        if reason == FlushReason::Shutdown {
            let _ = writer.shutdown().await;
            return None;
        }
    }
}
