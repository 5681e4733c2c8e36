//! # orblink
//!
//! Sessions between two peers that call each other's objects over one
//! ordered byte stream.
//!
//! ## Philosophy
//!
//! - **Symmetric**: both ends run the same handshake and either may call the
//!   other; there is no client or server role.
//! - **References, not copies**: objects cross the link as references. Each
//!   side tracks what it sent and received, and an object is released only
//!   once the peer has seen every copy sent to it.
//! - **Transport-agnostic**: anything that moves bytes in order will do.

pub mod transport;
pub mod stream;
pub mod mock_transport;
pub mod config;
pub mod error;
pub mod message;
pub mod hello;
pub mod keepalive;
pub mod spawner;
pub mod call;
mod handshake;
pub mod link;
pub mod builder;

pub use transport::Transport;
pub use transport::TransportError;

pub use stream::StreamTransport;
pub use mock_transport::DuplexChannelTransport;

pub use config::KeepAliveConfig;
pub use config::LinkConfig;

pub use error::CallError;
pub use error::LinkError;
pub use error::Result;

pub use message::MessageCode;
pub use hello::CopyleftInfo;
pub use keepalive::KeepAliveMonitor;
pub use keepalive::Liveness;
pub use spawner::Spawner;
pub use spawner::TokioSpawner;

pub use call::CallMode;
pub use call::PendingCall;

pub use link::Link;
pub use link::LinkStatus;
pub use builder::LinkBuilder;

#[cfg(test)]
mod tests;
