//! Protocol registration and message dispatch.
//!
//! Protocols register once at startup as dependency-annotated descriptors;
//! a topological sort assigns their numeric ids, with the designated
//! bootstrap protocol always forced to id 0. Each protocol then maps message
//! tags to handlers, message names to outgoing tags, and tags to
//! empty-container factories used to decode inbound payloads.
//!
//! Unknown messages are logged and dropped, never fatal — a peer running a
//! newer protocol revision must not be able to kill the connection by
//! sending a tag this build does not know. Handler failures are caught at
//! the dispatch boundary for the same reason.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::events::{ConnectionId, NetEvent};
use crate::frame::{FrameError, PayloadReader};
use crate::server::NetServer;

/// Errors raised while building the protocol table.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The same protocol name was declared twice.
    #[error("protocol {0:?} is declared twice")]
    DuplicateProtocol(&'static str),

    /// A declared dependency names no known protocol.
    #[error("protocol {protocol:?} depends on unknown protocol {dependency:?}")]
    UnknownDependency {
        /// The protocol declaring the dependency.
        protocol: &'static str,
        /// The missing dependency.
        dependency: &'static str,
    },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle involving protocol {0:?}")]
    DependencyCycle(&'static str),

    /// No protocol was marked as the bootstrap protocol.
    #[error("no bootstrap protocol was declared")]
    MissingBootstrap,

    /// More than one protocol was marked as the bootstrap protocol.
    #[error("more than one bootstrap protocol was declared")]
    DuplicateBootstrap,

    /// The bootstrap protocol declared dependencies; it always runs first.
    #[error("bootstrap protocol {0:?} cannot declare dependencies")]
    BootstrapDependencies(&'static str),
}

/// Errors raised when resolving messages against the table.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No message is registered under the given key.
    #[error("protocol {protocol_id} has no message {detail}")]
    UnexpectedMessage {
        /// The protocol looked up.
        protocol_id: u16,
        /// The tag or name that missed.
        detail: String,
    },

    /// The protocol id itself is not registered.
    #[error("protocol id {0} is not registered")]
    UnknownProtocol(u16),
}

/// A protocol module as declared at startup.
#[derive(Debug, Clone)]
pub struct ProtocolDescriptor {
    /// Name used in dependency declarations and lookups.
    pub name: &'static str,
    /// Names of protocols that must be registered before this one.
    pub dependencies: &'static [&'static str],
    /// Whether this is the bootstrap protocol pinned to id 0.
    pub bootstrap: bool,
}

impl ProtocolDescriptor {
    /// A protocol with no dependencies.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            dependencies: &[],
            bootstrap: false,
        }
    }

    /// A protocol depending on the named protocols.
    pub fn with_dependencies(name: &'static str, dependencies: &'static [&'static str]) -> Self {
        Self {
            name,
            dependencies,
            bootstrap: false,
        }
    }

    /// The bootstrap protocol, always assigned id 0.
    pub fn bootstrap(name: &'static str) -> Self {
        Self {
            name,
            dependencies: &[],
            bootstrap: true,
        }
    }
}

/// An inbound message container: decodes itself from a payload and is handed
/// to the handler as a type-erased box.
pub trait NetMessage: Send {
    /// Fill the container from the payload.
    fn read_payload(&mut self, reader: &mut PayloadReader) -> Result<(), FrameError>;

    /// Downcast support for handlers.
    fn as_any(&self) -> &dyn Any;
}

/// Context provided to every message handler.
pub struct HandlerContext {
    /// The connection the message arrived on.
    pub connection_id: ConnectionId,
    /// The server, for routing responses.
    pub server: Arc<NetServer>,
}

impl HandlerContext {
    /// Queue a response to the sending connection.
    ///
    /// The send happens on a spawned task; failures are logged, not
    /// surfaced, since the sender may already be gone.
    pub fn reply(&self, protocol_id: u16, tag: u16, payload: Vec<u8>) {
        let server = Arc::clone(&self.server);
        let id = self.connection_id;
        tokio::spawn(async move {
            if let Err(e) = server.send(id, protocol_id, tag, &payload).await {
                tracing::warn!(?id, %e, "reply failed");
            }
        });
    }
}

/// Trait for message handlers. Implemented for closures.
pub trait MessageHandler: Send + Sync {
    /// Process one decoded message.
    fn handle(&self, msg: Box<dyn NetMessage>, ctx: &HandlerContext);
}

impl<F> MessageHandler for F
where
    F: Fn(Box<dyn NetMessage>, &HandlerContext) + Send + Sync,
{
    fn handle(&self, msg: Box<dyn NetMessage>, ctx: &HandlerContext) {
        self(msg, ctx);
    }
}

/// What became of one dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler consumed the message (a panicking handler counts; the panic
    /// is logged and contained).
    Handled,
    /// Unknown protocol, unknown tag, or malformed payload; logged and dropped.
    Dropped,
    /// Strict payload checking found unread trailing bytes; the connection
    /// should be closed.
    Violation,
}

type ContainerFactory = Box<dyn Fn() -> Box<dyn NetMessage> + Send + Sync>;

struct ProtocolEntry {
    name: &'static str,
    handlers: HashMap<u16, Box<dyn MessageHandler>>,
    outgoing_tags: HashMap<&'static str, u16>,
    factories: HashMap<u16, ContainerFactory>,
}

/// The two-level (protocol id, message tag) handler table.
pub struct ProtocolTable {
    protocols: Vec<ProtocolEntry>,
    ids_by_name: HashMap<&'static str, u16>,
    strict_payload_checks: bool,
}

impl ProtocolTable {
    /// Build the table from dependency-annotated descriptors.
    ///
    /// Ids follow the topological order of the dependency graph, except the
    /// bootstrap protocol, which is always id 0.
    pub fn build(descriptors: &[ProtocolDescriptor]) -> Result<Self, RegistryError> {
        let order = sorted_order(descriptors)?;
        let mut protocols = Vec::with_capacity(order.len());
        let mut ids_by_name = HashMap::new();
        for (id, &index) in order.iter().enumerate() {
            let descriptor = &descriptors[index];
            ids_by_name.insert(descriptor.name, id as u16);
            protocols.push(ProtocolEntry {
                name: descriptor.name,
                handlers: HashMap::new(),
                outgoing_tags: HashMap::new(),
                factories: HashMap::new(),
            });
        }
        Ok(Self {
            protocols,
            ids_by_name,
            strict_payload_checks: false,
        })
    }

    /// Disconnect peers whose messages leave unread trailing bytes, instead
    /// of warn-and-discard.
    pub fn set_strict_payload_checks(&mut self, strict: bool) {
        self.strict_payload_checks = strict;
    }

    /// Look up a protocol's assigned id.
    pub fn protocol_id(&self, name: &str) -> Option<u16> {
        self.ids_by_name.get(name).copied()
    }

    /// Number of registered protocols.
    pub fn protocol_count(&self) -> usize {
        self.protocols.len()
    }

    /// Register a message under a protocol: its outgoing name and the
    /// container factory used to decode it inbound.
    pub fn register_message(
        &mut self,
        protocol_id: u16,
        tag: u16,
        name: &'static str,
        factory: impl Fn() -> Box<dyn NetMessage> + Send + Sync + 'static,
    ) -> Result<(), DispatchError> {
        let entry = self
            .protocols
            .get_mut(usize::from(protocol_id))
            .ok_or(DispatchError::UnknownProtocol(protocol_id))?;
        entry.outgoing_tags.insert(name, tag);
        entry.factories.insert(tag, Box::new(factory));
        Ok(())
    }

    /// Attach a handler to a (protocol, tag) key.
    pub fn add_handler(
        &mut self,
        protocol_id: u16,
        tag: u16,
        handler: impl MessageHandler + 'static,
    ) -> Result<(), DispatchError> {
        let entry = self
            .protocols
            .get_mut(usize::from(protocol_id))
            .ok_or(DispatchError::UnknownProtocol(protocol_id))?;
        entry.handlers.insert(tag, Box::new(handler));
        Ok(())
    }

    /// Resolve a message name to its outgoing tag.
    pub fn resolve_outgoing_tag(
        &self,
        protocol_id: u16,
        name: &str,
    ) -> Result<u16, DispatchError> {
        let entry = self
            .protocols
            .get(usize::from(protocol_id))
            .ok_or(DispatchError::UnknownProtocol(protocol_id))?;
        entry
            .outgoing_tags
            .get(name)
            .copied()
            .ok_or_else(|| DispatchError::UnexpectedMessage {
                protocol_id,
                detail: format!("named {name:?}"),
            })
    }

    /// Build an empty container for an inbound (protocol, tag) key.
    pub fn new_container(
        &self,
        protocol_id: u16,
        tag: u16,
    ) -> Result<Box<dyn NetMessage>, DispatchError> {
        let entry = self
            .protocols
            .get(usize::from(protocol_id))
            .ok_or(DispatchError::UnknownProtocol(protocol_id))?;
        entry
            .factories
            .get(&tag)
            .map(|factory| factory())
            .ok_or_else(|| DispatchError::UnexpectedMessage {
                protocol_id,
                detail: format!("with tag {tag}"),
            })
    }

    /// Route one inbound message to its handler.
    ///
    /// Unknown keys and malformed payloads are logged and dropped so version
    /// skew never takes a connection down. Handler panics stop at this
    /// boundary.
    pub fn dispatch(
        &self,
        ctx: &HandlerContext,
        protocol_id: u16,
        tag: u16,
        payload: Bytes,
    ) -> DispatchOutcome {
        let Some(entry) = self.protocols.get(usize::from(protocol_id)) else {
            tracing::warn!(protocol_id, tag, "message for unknown protocol dropped");
            return DispatchOutcome::Dropped;
        };
        let Some(handler) = entry.handlers.get(&tag) else {
            tracing::warn!(protocol = entry.name, tag, "unhandled message dropped");
            return DispatchOutcome::Dropped;
        };
        let Some(factory) = entry.factories.get(&tag) else {
            tracing::error!(
                protocol = entry.name,
                tag,
                "handler registered without a message container"
            );
            return DispatchOutcome::Dropped;
        };

        let mut container = factory();
        let mut reader = PayloadReader::new(payload);
        if let Err(e) = container.read_payload(&mut reader) {
            tracing::warn!(protocol = entry.name, tag, %e, "malformed payload dropped");
            return DispatchOutcome::Dropped;
        }
        let remaining = reader.remaining();
        if remaining > 0 {
            tracing::warn!(
                protocol = entry.name,
                tag,
                remaining,
                "message left unread trailing bytes"
            );
            if self.strict_payload_checks {
                return DispatchOutcome::Violation;
            }
            reader.drain();
        }

        if catch_unwind(AssertUnwindSafe(|| handler.handle(container, ctx))).is_err() {
            tracing::error!(protocol = entry.name, tag, "handler panicked");
        }
        DispatchOutcome::Handled
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Topologically sort the descriptors, bootstrap first.
fn sorted_order(descriptors: &[ProtocolDescriptor]) -> Result<Vec<usize>, RegistryError> {
    let mut index_of = HashMap::new();
    for (i, descriptor) in descriptors.iter().enumerate() {
        if index_of.insert(descriptor.name, i).is_some() {
            return Err(RegistryError::DuplicateProtocol(descriptor.name));
        }
    }

    let mut bootstrap = None;
    for (i, descriptor) in descriptors.iter().enumerate() {
        if descriptor.bootstrap {
            if bootstrap.is_some() {
                return Err(RegistryError::DuplicateBootstrap);
            }
            bootstrap = Some(i);
        }
    }
    let bootstrap = bootstrap.ok_or(RegistryError::MissingBootstrap)?;
    if !descriptors[bootstrap].dependencies.is_empty() {
        return Err(RegistryError::BootstrapDependencies(
            descriptors[bootstrap].name,
        ));
    }

    let mut marks = vec![Mark::Unvisited; descriptors.len()];
    let mut order = Vec::with_capacity(descriptors.len());
    visit(bootstrap, descriptors, &index_of, &mut marks, &mut order)?;
    for i in 0..descriptors.len() {
        visit(i, descriptors, &index_of, &mut marks, &mut order)?;
    }
    Ok(order)
}

fn visit(
    i: usize,
    descriptors: &[ProtocolDescriptor],
    index_of: &HashMap<&'static str, usize>,
    marks: &mut [Mark],
    order: &mut Vec<usize>,
) -> Result<(), RegistryError> {
    match marks[i] {
        Mark::Done => return Ok(()),
        Mark::InProgress => return Err(RegistryError::DependencyCycle(descriptors[i].name)),
        Mark::Unvisited => {}
    }
    marks[i] = Mark::InProgress;
    for &dependency in descriptors[i].dependencies {
        let Some(&j) = index_of.get(dependency) else {
            return Err(RegistryError::UnknownDependency {
                protocol: descriptors[i].name,
                dependency,
            });
        };
        visit(j, descriptors, index_of, marks, order)?;
    }
    marks[i] = Mark::Done;
    order.push(i);
    Ok(())
}

/// Drive dispatch for the application: routes `Message` events through the
/// table and hands every other event back to the caller.
///
/// Returns `None` when the event channel closes. Running this (or any other
/// single consumer) on one task is what serializes handler execution.
pub async fn pump_messages(
    rx: &mut mpsc::Receiver<NetEvent>,
    table: &ProtocolTable,
    server: &Arc<NetServer>,
) -> Option<NetEvent> {
    while let Some(event) = rx.recv().await {
        match event {
            NetEvent::Message {
                connection_id,
                protocol_id,
                tag,
                payload,
            } => {
                let ctx = HandlerContext {
                    connection_id,
                    server: Arc::clone(server),
                };
                let outcome = table.dispatch(&ctx, protocol_id, tag, payload);
                if outcome == DispatchOutcome::Violation {
                    tracing::warn!(
                        ?connection_id,
                        "closing connection after strict payload violation"
                    );
                    let _ = server.try_close(connection_id).await;
                }
            }
            other => return Some(other),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use crate::endpoint::{Endpoint, TransportConfig};
    use crate::events::event_channel;
    use crate::server::{NetServer, ServerConfig};

    /// Container that swallows the whole payload as raw bytes.
    #[derive(Default)]
    struct RawBody {
        body: Bytes,
    }

    impl NetMessage for RawBody {
        fn read_payload(&mut self, reader: &mut PayloadReader) -> Result<(), FrameError> {
            self.body = reader.read_bytes(reader.remaining())?;
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Container with one u16 field; leaves any extra payload bytes unread.
    #[derive(Default)]
    struct OneField {
        value: u16,
    }

    impl NetMessage for OneField {
        fn read_payload(&mut self, reader: &mut PayloadReader) -> Result<(), FrameError> {
            self.value = reader.read_u16()?;
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn two_protocol_table() -> ProtocolTable {
        ProtocolTable::build(&[
            ProtocolDescriptor::with_dependencies("game", &["session"]),
            ProtocolDescriptor::bootstrap("session"),
        ])
        .unwrap()
    }

    fn dummy_server() -> Arc<NetServer> {
        let (server, _events) = NetServer::new(ServerConfig::default());
        Arc::new(server)
    }

    fn ctx_for(server: &Arc<NetServer>, id: u64) -> HandlerContext {
        HandlerContext {
            connection_id: ConnectionId(id),
            server: Arc::clone(server),
        }
    }

    #[test]
    fn test_bootstrap_is_forced_to_id_zero() {
        let table = two_protocol_table();
        assert_eq!(table.protocol_id("session"), Some(0));
        assert_eq!(table.protocol_id("game"), Some(1));
        assert_eq!(table.protocol_count(), 2);
    }

    #[test]
    fn test_dependency_order_assigns_ids() {
        let table = ProtocolTable::build(&[
            ProtocolDescriptor::with_dependencies("scopes", &["auth"]),
            ProtocolDescriptor::with_dependencies("auth", &["session"]),
            ProtocolDescriptor::bootstrap("session"),
        ])
        .unwrap();
        assert_eq!(table.protocol_id("session"), Some(0));
        assert_eq!(table.protocol_id("auth"), Some(1));
        assert_eq!(table.protocol_id("scopes"), Some(2));
    }

    #[test]
    fn test_missing_bootstrap_rejected() {
        let result = ProtocolTable::build(&[ProtocolDescriptor::new("game")]);
        assert!(matches!(result, Err(RegistryError::MissingBootstrap)));
    }

    #[test]
    fn test_duplicate_bootstrap_rejected() {
        let result = ProtocolTable::build(&[
            ProtocolDescriptor::bootstrap("a"),
            ProtocolDescriptor::bootstrap("b"),
        ]);
        assert!(matches!(result, Err(RegistryError::DuplicateBootstrap)));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let result = ProtocolTable::build(&[
            ProtocolDescriptor::bootstrap("session"),
            ProtocolDescriptor::new("game"),
            ProtocolDescriptor::new("game"),
        ]);
        assert!(matches!(
            result,
            Err(RegistryError::DuplicateProtocol("game"))
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let result = ProtocolTable::build(&[
            ProtocolDescriptor::bootstrap("session"),
            ProtocolDescriptor::with_dependencies("game", &["nonexistent"]),
        ]);
        assert!(matches!(
            result,
            Err(RegistryError::UnknownDependency {
                protocol: "game",
                dependency: "nonexistent",
            })
        ));
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let result = ProtocolTable::build(&[
            ProtocolDescriptor::bootstrap("session"),
            ProtocolDescriptor::with_dependencies("a", &["b"]),
            ProtocolDescriptor::with_dependencies("b", &["a"]),
        ]);
        assert!(matches!(result, Err(RegistryError::DependencyCycle(_))));
    }

    #[test]
    fn test_bootstrap_with_dependencies_rejected() {
        let descriptors = [
            ProtocolDescriptor {
                name: "session",
                dependencies: &["game"],
                bootstrap: true,
            },
            ProtocolDescriptor::new("game"),
        ];
        assert!(matches!(
            ProtocolTable::build(&descriptors),
            Err(RegistryError::BootstrapDependencies("session"))
        ));
    }

    #[test]
    fn test_dispatch_routes_to_typed_handler() {
        let mut table = two_protocol_table();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        table
            .register_message(1, 5, "move", || Box::new(OneField::default()))
            .unwrap();
        table
            .add_handler(1, 5, move |msg: Box<dyn NetMessage>, _ctx: &HandlerContext| {
                let field = msg.as_any().downcast_ref::<OneField>().unwrap();
                assert_eq!(field.value, 513);
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let server = dummy_server();
        let outcome = table.dispatch(&ctx_for(&server, 1), 1, 5, Bytes::from_static(&[1, 2]));
        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_tag_dropped_without_breaking_later_dispatch() {
        let mut table = two_protocol_table();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        table
            .register_message(1, 5, "move", || Box::new(RawBody::default()))
            .unwrap();
        table
            .add_handler(1, 5, move |_msg: Box<dyn NetMessage>, _ctx: &HandlerContext| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let server = dummy_server();
        let ctx = ctx_for(&server, 1);
        assert_eq!(
            table.dispatch(&ctx, 1, 99, Bytes::from_static(b"junk")),
            DispatchOutcome::Dropped
        );
        assert_eq!(
            table.dispatch(&ctx, 7, 5, Bytes::from_static(b"junk")),
            DispatchOutcome::Dropped
        );
        assert_eq!(
            table.dispatch(&ctx, 1, 5, Bytes::from_static(b"ok")),
            DispatchOutcome::Handled
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let mut table = two_protocol_table();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        table
            .register_message(0, 1, "hello", || Box::new(RawBody::default()))
            .unwrap();
        table
            .add_handler(0, 1, |_msg: Box<dyn NetMessage>, _ctx: &HandlerContext| {
                panic!("handler bug")
            })
            .unwrap();
        table
            .register_message(0, 2, "world", || Box::new(RawBody::default()))
            .unwrap();
        table
            .add_handler(0, 2, move |_msg: Box<dyn NetMessage>, _ctx: &HandlerContext| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let server = dummy_server();
        let ctx = ctx_for(&server, 1);
        let outcome = table.dispatch(&ctx, 0, 1, Bytes::new());
        assert_eq!(outcome, DispatchOutcome::Handled);
        // The panic must not poison later dispatches.
        assert_eq!(table.dispatch(&ctx, 0, 2, Bytes::new()), DispatchOutcome::Handled);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trailing_bytes_warn_and_discard_by_default() {
        let mut table = two_protocol_table();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        table
            .register_message(0, 2, "short", || Box::new(OneField::default()))
            .unwrap();
        table
            .add_handler(0, 2, move |_msg: Box<dyn NetMessage>, _ctx: &HandlerContext| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let server = dummy_server();
        // Two bytes consumed, three left over.
        let outcome = table.dispatch(
            &ctx_for(&server, 1),
            0,
            2,
            Bytes::from_static(&[1, 0, 9, 9, 9]),
        );
        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trailing_bytes_violate_in_strict_mode() {
        let mut table = two_protocol_table();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        table.set_strict_payload_checks(true);
        table
            .register_message(0, 2, "short", || Box::new(OneField::default()))
            .unwrap();
        table
            .add_handler(0, 2, move |_msg: Box<dyn NetMessage>, _ctx: &HandlerContext| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let server = dummy_server();
        let outcome = table.dispatch(
            &ctx_for(&server, 1),
            0,
            2,
            Bytes::from_static(&[1, 0, 9, 9, 9]),
        );
        assert_eq!(outcome, DispatchOutcome::Violation);
        assert_eq!(hits.load(Ordering::SeqCst), 0, "violating message must not reach the handler");
    }

    #[test]
    fn test_resolve_outgoing_tag() {
        let mut table = two_protocol_table();
        table
            .register_message(1, 6, "pong", || Box::new(RawBody::default()))
            .unwrap();

        assert_eq!(table.resolve_outgoing_tag(1, "pong").unwrap(), 6);
        assert!(matches!(
            table.resolve_outgoing_tag(1, "missing"),
            Err(DispatchError::UnexpectedMessage { protocol_id: 1, .. })
        ));
        assert!(matches!(
            table.resolve_outgoing_tag(9, "pong"),
            Err(DispatchError::UnknownProtocol(9))
        ));
    }

    #[test]
    fn test_new_container_requires_registration() {
        let mut table = two_protocol_table();
        table
            .register_message(0, 1, "hello", || Box::new(OneField::default()))
            .unwrap();

        assert!(table.new_container(0, 1).is_ok());
        assert!(matches!(
            table.new_container(0, 9),
            Err(DispatchError::UnexpectedMessage { protocol_id: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_ping_pong() {
        // Server with a handler for (1, 5) that replies (1, 6, "PONG").
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        };
        let (server, mut server_events) = NetServer::new(config);
        let server = Arc::new(server);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        server.start_with_listener(listener).unwrap();

        let mut table = two_protocol_table();
        table
            .register_message(1, 5, "ping", || Box::new(RawBody::default()))
            .unwrap();
        table
            .add_handler(1, 5, |msg: Box<dyn NetMessage>, ctx: &HandlerContext| {
                let ping = msg.as_any().downcast_ref::<RawBody>().unwrap();
                assert_eq!(ping.body.as_ref(), b"PING");
                ctx.reply(1, 6, b"PONG".to_vec());
            })
            .unwrap();

        let pump_server = Arc::clone(&server);
        tokio::spawn(async move {
            loop {
                if pump_messages(&mut server_events, &table, &pump_server)
                    .await
                    .is_none()
                {
                    break;
                }
            }
        });

        // Client endpoint on the same wire contract.
        let (client_tx, mut client_events) = event_channel(16);
        let client = Endpoint::connect(addr, ConnectionId(0), &TransportConfig::default(), client_tx)
            .await
            .unwrap();

        client.send(1, 5, b"PING").await.unwrap();

        assert!(matches!(
            client_events.recv().await,
            Some(NetEvent::ClientConnected(_))
        ));
        match timeout(Duration::from_secs(2), client_events.recv())
            .await
            .unwrap()
        {
            Some(NetEvent::Message {
                protocol_id,
                tag,
                payload,
                ..
            }) => {
                assert_eq!((protocol_id, tag), (1, 6));
                assert_eq!(payload.as_ref(), b"PONG");
            }
            other => panic!("expected pong, got {other:?}"),
        }

        // Nothing extraneous behind the pong.
        let extra = timeout(Duration::from_millis(200), client_events.recv()).await;
        assert!(extra.is_err(), "unexpected trailing event: {extra:?}");
    }
}
