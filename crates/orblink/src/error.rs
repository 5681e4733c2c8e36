use orbpack::Value;

use crate::transport;

/// Why a link failed or refused an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkError {
    /// The link is closing or closed.
    Closed,
    /// A wait on the link ran out of time.
    Timeout,
    /// The peer gateway was released and can no longer be handed out.
    NoGateway,
    /// The peer sent something the protocol does not allow.
    ProtocolViolation(String),
    /// Protocol or link handshake failed.
    Handshake(String),
    Codec(orbpack::Error),
    Transport(transport::Error),
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Link is closed"),
            Self::Timeout => write!(f, "Link operation timed out"),
            Self::NoGateway => write!(f, "Peer gateway is no longer available"),
            Self::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            Self::Handshake(msg) => write!(f, "Handshake failed: {}", msg),
            Self::Codec(e) => write!(f, "Codec error: {}", e),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<orbpack::Error> for LinkError {
    fn from(e: orbpack::Error) -> Self {
        Self::Codec(e)
    }
}

impl From<transport::Error> for LinkError {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

/// Outcome of a remote call that produced no result.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// The peer could not perform the call (CALL_ERROR).
    Invalid,
    /// The callee raised; the value is the peer's exception.
    Exception(Value),
    /// The caller cancelled the call.
    Cancelled,
    /// The target is a proxy of another link; call it there.
    ForeignTarget,
    /// The link failed before a result arrived.
    Link(LinkError),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid => write!(f, "Peer could not perform the call"),
            Self::Exception(value) => write!(f, "Remote exception: {:?}", value),
            Self::Cancelled => write!(f, "Call was cancelled"),
            Self::ForeignTarget => write!(f, "Call target belongs to another link"),
            Self::Link(e) => write!(f, "Link error: {}", e),
        }
    }
}

impl std::error::Error for CallError {}

impl From<LinkError> for CallError {
    fn from(e: LinkError) -> Self {
        Self::Link(e)
    }
}

impl From<orbpack::Error> for CallError {
    fn from(e: orbpack::Error) -> Self {
        Self::Link(LinkError::Codec(e))
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
