//! The endpoint registry and the accept loop.
//!
//! One task accepts connections, hands each socket to an [`Endpoint`], and
//! tracks the live connections by id. The application talks to peers only
//! through the server's `send`/`close`/`try_broadcast` surface; it never
//! sees the sockets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock, mpsc, watch};

use crate::endpoint::{Endpoint, TransportConfig};
use crate::error::NetError;
use crate::events::{ConnectionId, LOCAL_CONNECTION_ID, NetEvent, event_channel};
use crate::local::{LocalEndpoint, LocalPeer};

/// Hands out connection ids: monotonically increasing, and on exhaustion of
/// the id space a linear probe from 1 for the first id not in use. Id 0 is
/// never produced; it belongs to the loopback endpoint.
pub struct IdAllocator {
    next: u64,
    id_space: u64,
}

impl IdAllocator {
    /// Full-range allocator.
    pub fn new() -> Self {
        Self::with_id_space(u64::MAX)
    }

    /// Allocator producing ids in `1..=id_space`; small spaces let tests
    /// force wraparound.
    pub fn with_id_space(id_space: u64) -> Self {
        Self {
            next: 1,
            id_space,
        }
    }

    /// Produce the next id not currently in use, or `None` when every id in
    /// the space is taken.
    pub fn allocate(&mut self, in_use: impl Fn(ConnectionId) -> bool) -> Option<ConnectionId> {
        for _ in 0..self.id_space {
            let candidate = ConnectionId(self.next);
            self.next = if self.next == self.id_space {
                1
            } else {
                self.next + 1
            };
            if !in_use(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered peer: a socket-backed endpoint or the loopback.
#[derive(Clone)]
pub(crate) enum Peer {
    Remote(Arc<Endpoint>),
    Local(Arc<LocalPeer>),
}

impl Peer {
    async fn send(&self, protocol_id: u16, tag: u16, payload: &[u8]) -> Result<(), NetError> {
        match self {
            Peer::Remote(endpoint) => endpoint.send(protocol_id, tag, payload).await,
            Peer::Local(peer) => peer.deliver(protocol_id, tag, payload),
        }
    }
}

/// Live connections keyed by id, shared between the accept loop, the
/// per-connection cleanup tasks, and the application-facing calls.
pub(crate) struct Registry {
    peers: RwLock<HashMap<ConnectionId, Peer>>,
    ids: Mutex<IdAllocator>,
    events: mpsc::Sender<NetEvent>,
    max_connections: usize,
}

impl Registry {
    fn new(events: mpsc::Sender<NetEvent>, max_connections: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            ids: Mutex::new(IdAllocator::new()),
            events,
            max_connections,
        }
    }

    async fn allocate(&self) -> Option<ConnectionId> {
        let peers = self.peers.read().await;
        if peers.len() >= self.max_connections {
            return None;
        }
        let mut ids = self.ids.lock().await;
        ids.allocate(|id| peers.contains_key(&id))
    }

    async fn insert(&self, id: ConnectionId, peer: Peer) {
        self.peers.write().await.insert(id, peer);
    }

    async fn insert_local(&self, peer: Arc<LocalPeer>) -> Result<(), NetError> {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&LOCAL_CONNECTION_ID) {
            return Err(NetError::LocalAlreadyAttached);
        }
        peers.insert(LOCAL_CONNECTION_ID, Peer::Local(peer));
        Ok(())
    }

    async fn remove(&self, id: ConnectionId) -> Option<Peer> {
        self.peers.write().await.remove(&id)
    }

    async fn get(&self, id: ConnectionId) -> Option<Peer> {
        self.peers.read().await.get(&id).cloned()
    }

    async fn ids(&self) -> Vec<ConnectionId> {
        self.peers.read().await.keys().copied().collect()
    }

    async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Detach the loopback endpoint and fire its disconnect event.
    pub(crate) async fn close_local(&self) -> Result<(), NetError> {
        let removed = { self.peers.write().await.remove(&LOCAL_CONNECTION_ID) };
        match removed {
            Some(Peer::Local(peer)) => {
                peer.mark_closed();
                let _ = self
                    .events
                    .send(NetEvent::ClientDisconnected {
                        connection_id: LOCAL_CONNECTION_ID,
                        error: None,
                    })
                    .await;
                Ok(())
            }
            Some(Peer::Remote(endpoint)) => {
                // id 0 never holds a remote endpoint
                let _ = endpoint.close();
                Ok(())
            }
            None => Err(NetError::AlreadyClosed),
        }
    }

    /// Ask every registered peer to close. Remote disconnect events arrive
    /// asynchronously from their life-cycle tasks.
    async fn close_all(&self) {
        let snapshot: Vec<(ConnectionId, Peer)> = {
            self.peers
                .read()
                .await
                .iter()
                .map(|(id, peer)| (*id, peer.clone()))
                .collect()
        };
        for (id, peer) in snapshot {
            match peer {
                Peer::Remote(endpoint) => {
                    if let Err(e) = endpoint.close() {
                        tracing::debug!(?id, %e, "endpoint already closing");
                    }
                }
                Peer::Local(_) => {
                    let _ = self.close_local().await;
                }
            }
        }
    }
}

/// Configuration for [`NetServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to. Default: `0.0.0.0:7777`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections. Default: 256.
    pub max_connections: usize,
    /// Depth of the event channel handed to the application. Default: 1024.
    pub event_queue_depth: usize,
    /// Per-connection tuning shared by every accepted endpoint.
    pub transport: TransportConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7777".parse().unwrap(),
            max_connections: 256,
            event_queue_depth: 1024,
            transport: TransportConfig::default(),
        }
    }
}

/// The transport server: accept loop plus the id-keyed peer registry.
pub struct NetServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    events_tx: mpsc::Sender<NetEvent>,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    // kept so the watch channel stays open between runs
    _shutdown_rx: watch::Receiver<bool>,
}

impl NetServer {
    /// Create a server and the event stream the application drains.
    pub fn new(config: ServerConfig) -> (Self, mpsc::Receiver<NetEvent>) {
        let (events_tx, events_rx) = event_channel(config.event_queue_depth);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Arc::new(Registry::new(events_tx.clone(), config.max_connections));
        let server = Self {
            config,
            registry,
            events_tx,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            _shutdown_rx: shutdown_rx,
        };
        (server, events_rx)
    }

    /// Bind the configured address and start accepting.
    pub async fn start(&self) -> Result<(), NetError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "server listening");
        self.start_with_listener(listener)
    }

    /// Start accepting on a pre-bound listener (useful for tests).
    pub fn start_with_listener(&self, listener: TcpListener) -> Result<(), NetError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(NetError::AlreadyRunning);
        }
        self.shutdown_tx.send_replace(false);

        let registry = Arc::clone(&self.registry);
        let events = self.events_tx.clone();
        let transport = self.config.transport.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let running = Arc::clone(&self.running);

        tokio::spawn(async move {
            let _ = events.send(NetEvent::ServerStarted).await;
            let stop_error =
                accept_loop(listener, Arc::clone(&registry), events.clone(), transport, shutdown_rx)
                    .await;
            registry.close_all().await;
            running.store(false, Ordering::Release);
            match &stop_error {
                None => tracing::info!("server stopped"),
                Some(e) => tracing::error!(%e, "server stopped abnormally"),
            }
            let _ = events.send(NetEvent::ServerStopped { error: stop_error }).await;
        });
        Ok(())
    }

    /// Stop accepting and close every registered peer.
    ///
    /// The `ServerStopped` event fires after every peer has been told to
    /// close; individual disconnect events may still trail it.
    pub fn stop(&self) -> Result<(), NetError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(NetError::NotRunning);
        }
        self.shutdown_tx.send_replace(true);
        Ok(())
    }

    /// Whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of registered peers (loopback included).
    pub async fn client_count(&self) -> usize {
        self.registry.len().await
    }

    /// Send to one peer; fails with [`NetError::UnknownClient`] for an
    /// unregistered id.
    pub async fn send(
        &self,
        id: ConnectionId,
        protocol_id: u16,
        tag: u16,
        payload: &[u8],
    ) -> Result<(), NetError> {
        let peer = self
            .registry
            .get(id)
            .await
            .ok_or(NetError::UnknownClient(id))?;
        peer.send(protocol_id, tag, payload).await
    }

    /// Like [`NetServer::send`], but an unknown id yields `Ok(false)`
    /// instead of an error.
    pub async fn try_send(
        &self,
        id: ConnectionId,
        protocol_id: u16,
        tag: u16,
        payload: &[u8],
    ) -> Result<bool, NetError> {
        match self.registry.get(id).await {
            None => Ok(false),
            Some(peer) => peer.send(protocol_id, tag, payload).await.map(|()| true),
        }
    }

    /// Send to the given peers, or to every registered peer when `targets`
    /// is `None`. Per-id failures are collected instead of aborting the
    /// remaining sends.
    pub async fn try_broadcast(
        &self,
        targets: Option<&[ConnectionId]>,
        protocol_id: u16,
        tag: u16,
        payload: &[u8],
    ) -> Vec<(ConnectionId, NetError)> {
        let ids = match targets {
            Some(ids) => ids.to_vec(),
            None => self.registry.ids().await,
        };
        let mut failed = Vec::new();
        for id in ids {
            match self.registry.get(id).await {
                None => failed.push((id, NetError::UnknownClient(id))),
                Some(peer) => {
                    if let Err(e) = peer.send(protocol_id, tag, payload).await {
                        failed.push((id, e));
                    }
                }
            }
        }
        failed
    }

    /// Close one peer; fails with [`NetError::UnknownClient`] for an
    /// unregistered id.
    pub async fn close(&self, id: ConnectionId) -> Result<(), NetError> {
        let peer = self
            .registry
            .get(id)
            .await
            .ok_or(NetError::UnknownClient(id))?;
        self.close_peer(peer).await
    }

    /// Like [`NetServer::close`], but an unknown id yields `Ok(false)`.
    pub async fn try_close(&self, id: ConnectionId) -> Result<bool, NetError> {
        match self.registry.get(id).await {
            None => Ok(false),
            Some(peer) => self.close_peer(peer).await.map(|()| true),
        }
    }

    async fn close_peer(&self, peer: Peer) -> Result<(), NetError> {
        match peer {
            Peer::Remote(endpoint) => endpoint.close(),
            Peer::Local(_) => self.registry.close_local().await,
        }
    }

    /// Attach the host-process loopback endpoint under connection id 0.
    ///
    /// `on_message` receives everything the server sends to id 0, dispatched
    /// immediately. Fires `ClientConnected(0)`.
    pub async fn attach_local(
        &self,
        on_message: impl Fn(u16, u16, Bytes) + Send + Sync + 'static,
    ) -> Result<LocalEndpoint, NetError> {
        let peer = Arc::new(LocalPeer::new(
            self.config.transport.max_message_size,
            on_message,
        ));
        self.registry.insert_local(Arc::clone(&peer)).await?;
        let _ = self
            .events_tx
            .send(NetEvent::ClientConnected(LOCAL_CONNECTION_ID))
            .await;
        Ok(LocalEndpoint::new(
            Arc::clone(&self.registry),
            self.events_tx.clone(),
            peer,
            self.config.transport.max_message_size,
        ))
    }
}

/// Accept until stopped. Returns `None` on an explicit stop and the error on
/// a listener-level failure.
async fn accept_loop(
    listener: TcpListener,
    registry: Arc<Registry>,
    events: mpsc::Sender<NetEvent>,
    transport: TransportConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Option<NetError> {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let Some(id) = registry.allocate().await else {
                            tracing::warn!(%peer_addr, "connection limit reached, rejecting");
                            continue;
                        };
                        match Endpoint::from_stream(id, stream, &transport, events.clone()) {
                            Ok((endpoint, lifecycle)) => {
                                tracing::info!(?id, %peer_addr, "accepted connection");
                                registry.insert(id, Peer::Remote(Arc::new(endpoint))).await;
                                let cleanup_registry = Arc::clone(&registry);
                                let cleanup_events = events.clone();
                                tokio::spawn(async move {
                                    let error = lifecycle.await;
                                    cleanup_registry.remove(id).await;
                                    let _ = cleanup_events
                                        .send(NetEvent::ClientDisconnected {
                                            connection_id: id,
                                            error,
                                        })
                                        .await;
                                });
                            }
                            Err(e) => {
                                tracing::warn!(%peer_addr, %e, "failed to wrap accepted socket");
                            }
                        }
                    }
                    Err(e) => return Some(NetError::Io(e)),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return None;
                }
            }
        }
    }
}
