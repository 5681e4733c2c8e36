//! # Transport Abstraction
//!
//! A minimal, async interface for moving bytes between link peers.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about values or messages.
//!   It moves opaque chunks of an ordered, reliable stream.
//! - **No Framing**: Chunk boundaries carry no meaning. The link's reader
//!   finds value boundaries itself, so a transport may split or merge writes.

use std::fmt;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// The operation timed out.
    Timeout,
    /// The payload exceeds what the transport accepts.
    PayloadTooLarge,
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Timeout => write!(f, "Transport timed out"),
            Self::PayloadTooLarge => write!(f, "Payload too large for transport"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Error = TransportError;

pub type Result<T> = std::result::Result<T, TransportError>;

/// An ordered, reliable byte stream.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queues bytes for the peer, in call order.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Next chunk from the peer; `Ok(None)` once the peer closed its side.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Closes the sending side. Already queued bytes are still delivered.
    async fn close(&self) -> Result<()>;
}
