//! Error types for the sync layer.

use thiserror::Error;
use uuid::Uuid;

pub use conway_core::MutationError;

/// The upgrade request did not carry a usable `token` parameter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("request has no token parameter")]
    MissingToken,
    #[error("malformed token in request target {0:?}")]
    MalformedToken(String),
}

/// Wire-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("server closed the connection ({code}): {reason}")]
    Rejected { code: u16, reason: String },
    #[error("connection timeout")]
    Timeout,
}

/// Registry admission failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session registry is full ({capacity} sessions)")]
    Full { capacity: usize },
    #[error("session {0} is not open")]
    NotOpen(Uuid),
}

/// Top-level error for server and client entry points.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Session(#[from] SessionError),
}
