//! Coalescing TCP message transport: wire framing, train buffering,
//! per-connection life-cycle, the endpoint registry, and protocol dispatch.

pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod frame;
pub mod local;
pub mod server;
pub mod train;

pub use dispatch::{
    DispatchError, DispatchOutcome, HandlerContext, MessageHandler, NetMessage,
    ProtocolDescriptor, ProtocolTable, RegistryError, pump_messages,
};
pub use endpoint::{Endpoint, TransportConfig};
pub use error::NetError;
pub use events::{ConnectionId, LOCAL_CONNECTION_ID, NetEvent, event_channel};
pub use frame::{FrameError, FrameHeader, HEADER_SIZE, PayloadReader, PayloadWriter};
pub use local::LocalEndpoint;
pub use server::{IdAllocator, NetServer, ServerConfig};
pub use train::{FlushReason, TrainBuffer};
