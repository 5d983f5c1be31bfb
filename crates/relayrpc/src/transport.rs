//! # Transport Abstraction
//!
//! A minimal, async interface for moving bytes between peers.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about messages, sessions,
//!   or envelopes. It moves opaque buffers.
//! - **One send, one delivery**: A single `send` must arrive verbatim as a single
//!   `recv` on the other side. No further framing is assumed.
//! - **Pull-based delivery**: The peer drives `recv` from its own pump task, so a
//!   transport never calls back into the engine.

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The peer is unreachable or the connection was dropped.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The operation timed out.
    #[error("transport timed out")]
    Timeout,
    /// The remote peer rejected the payload size.
    #[error("payload too large for transport")]
    PayloadTooLarge,
    /// Generic I/O error or internal transport failure.
    #[error("i/o error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A bidirectional, message-oriented byte channel.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Delivers one opaque payload to the other side.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits for the next payload. `Ok(None)` means the stream closed cleanly.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Closes the channel. The reason is informational.
    async fn disconnect(&self, reason: Option<&str>);

    /// Whether this transport can persist a reconnection token.
    fn supports_reconnection_token(&self) -> bool {
        false
    }

    /// Installs a refreshed reconnection token. Ignored unless supported.
    fn set_reconnection_token(&self, _token: &str) {}
}
