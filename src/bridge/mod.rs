//! UI ↔ worker bridge
//!
//! Request/response correlation over a duplex message channel between the UI
//! context and the key-holding worker context.

pub mod client;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod worker;

pub use client::{ReadyState, RpcBridge, WorkerEvent};
pub use error::{BridgeError, TransportError};
pub use protocol::{Message, ReadyInfo, SerializedError, WorkerRequest};
pub use transport::{ChannelTransport, LocalChannel, MessageHandler, StreamTransport};
pub use worker::{WorkerHandler, WorkerHost};
