//! A bidirectional JSON-RPC 2.0 engine and lifecycle runtime for the
//! Language Server Protocol.
//!
//! The crate is organized leaf-first, mirroring the data flow: bytes
//! arrive, are decoded by [`codec`] into a [`msg::Message`], routed by
//! [`dispatcher`] (optionally gated by [`lifecycle`]) through a
//! [`connection::Connection`], which is the type most callers construct
//! directly.

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod msg;
pub mod typed;

#[cfg(feature = "stdio")]
pub mod transport;

pub use codec::{encode_message, Codec, ProtocolError};
pub use config::ConnectionConfig;
pub use connection::{Connection, RequestRouter};
pub use dispatcher::{Dispatcher, NotificationHandler, RequestHandler, SharedDispatcher};
pub use error::{ExtractError, RpcError};
pub use lifecycle::{InitializeHook, InitializeOutcome, LifecycleGate, LifecycleState, TraceValue};
pub use msg::{
    ErrorCode, Message, Notification, Request, RequestId, Response, ResponseError, JSONRPC_VERSION,
};
