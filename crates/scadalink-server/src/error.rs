//! Error types for the gateway services.

use thiserror::Error;

use scadalink_protocol::CodecError;

use crate::registry::ClientId;

/// A fast-store or time-series store operation failed.
///
/// These are transient: callers log them and retry on their next tick.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("cannot decode stored data: {0}")]
    Decode(String),
}

/// A device link operation failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("RTU unreachable: {0}")]
    Unreachable(String),

    #[error("RTU did not answer in time")]
    Timeout,

    #[error("RTU rejected the request: {0}")]
    Rejected(String),

    #[error("RTU is not connected")]
    NotConnected,
}

/// Subscription routing errors.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("unknown client {0}")]
    UnknownClient(ClientId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors that end a single client connection.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
