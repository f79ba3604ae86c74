//! Error types surfaced at the crate's boundaries.
//!
//! [`ProtocolError`] lives in [`crate::codec`] (it's a framing-layer
//! concern). This module carries the two error kinds that sit above
//! framing: failures to extract a typed payload from an untyped
//! [`Request`]/[`Notification`], grounded in the teacher's `error.rs`, and
//! [`RpcError`], the failure channel for an outbound `send_request` that
//! never got a clean success response.

use std::fmt;

use crate::msg::{Notification, Request, ResponseError};

/// Failure to decode a typed payload out of an untyped [`Request`] or
/// [`Notification`].
#[derive(Debug)]
pub enum ExtractError<T> {
    /// The message was for a different method than expected.
    MethodMismatch(T),
    /// The method matched, but the params failed to deserialize.
    JsonError {
        /// The method that was being decoded.
        method: String,
        /// The underlying deserialization error.
        error: serde_json::Error,
    },
}

impl std::error::Error for ExtractError<Request> {}
impl fmt::Display for ExtractError<Request> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::MethodMismatch(req) => {
                write!(f, "method mismatch for request '{}'", req.method)
            }
            ExtractError::JsonError { method, error } => {
                write!(f, "invalid params for request '{method}': {error}")
            }
        }
    }
}

impl std::error::Error for ExtractError<Notification> {}
impl fmt::Display for ExtractError<Notification> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::MethodMismatch(notif) => {
                write!(f, "method mismatch for notification '{}'", notif.method)
            }
            ExtractError::JsonError { method, error } => {
                write!(f, "invalid params for notification '{method}': {error}")
            }
        }
    }
}

/// The failure channel for an outbound [`crate::Connection::send_request`].
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The peer replied with a JSON-RPC error object.
    #[error("request failed: {0}")]
    Protocol(#[from] ResponseError),
    /// The peer's decoded result could not be converted to the expected
    /// type.
    #[error("failed to decode result: {0}")]
    Decode(#[source] serde_json::Error),
    /// No response arrived before the configured timeout elapsed. The
    /// pending entry has been cancelled; the peer is not automatically
    /// notified (callers may send `$/cancelRequest` themselves).
    #[error("request timed out")]
    Timeout,
    /// The request was explicitly cancelled via `Connection::cancel`.
    #[error("request was cancelled")]
    Cancelled,
    /// The connection was closed while the request was still pending.
    #[error("connection closed")]
    ConnectionClosed,
}
