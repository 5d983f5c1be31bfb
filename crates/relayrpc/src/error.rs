//! # Error Definitions
//!
//! The central ledger of all operational and protocol failures.
//!
//! Errors raised on the *remote* side never cross the wire as structured
//! values. They arrive as their string form and surface as [`RpcError::Remote`].

use crate::transport::TransportError;

/// Failures of the RPC engine, local or remote.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// Missing or invalid construction parameters.
    #[error("configuration error: {0}")]
    Config(String),
    /// Visibility or workspace mismatch.
    #[error("permission denied: {0}")]
    Permission(String),
    /// Unknown service, method, or session.
    #[error("not found: {0}")]
    NotFound(String),
    /// No settlement or heartbeat within the configured budget.
    #[error("method call timed out: {method}")]
    Timeout { method: String },
    /// Malformed message or envelope.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A value with no wire representation was handed to the encoder.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),
    /// Send or connect failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// The remote side rejected the call; carries its error string.
    #[error("{0}")]
    Remote(String),
    /// A one-shot callback handle was invoked a second time.
    #[error("callback already used: {0}")]
    CallbackUsed(String),
    /// A call declared a parent session that no longer exists.
    #[error("parent session closed: {0}")]
    ParentSessionClosed(String),
    /// A registered codec failed or conflicts with a built-in tag.
    #[error("codec error: {0}")]
    Codec(String),
    /// Registration without `overwrite` hit an existing id.
    #[error("service already exists: {0}")]
    ServiceExists(String),
    /// An argument was present but not usable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The peer was disconnected while the call was pending.
    #[error("peer disconnected")]
    Disconnected,
}

impl RpcError {
    /// Builds a rejection from an arbitrary message, as user handlers do.
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }
}

impl From<relaypack::Error> for RpcError {
    fn from(e: relaypack::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// A specialized Result type for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;
