//! Error types for the RDMA key-value store

use thiserror::Error;

/// Result type alias using KvError
pub type Result<T> = std::result::Result<T, KvError>;

/// Errors surfaced by the client engine, the server engine and the transport
#[derive(Debug, Error)]
pub enum KvError {
    /// A send, receive, registration or one-sided operation failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The peer closed its end of the connection
    #[error("Peer disconnected")]
    Disconnected,

    /// A one-sided operation or deregistration named an rkey the fabric does not know
    #[error("Unknown memory region: rkey={0}")]
    UnknownRegion(u32),

    /// A packet arrived in a state the protocol does not allow
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl KvError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// Whether the error came from what one peer sent, rather than from the
    /// local transport. Such errors spoil one message, not the connection.
    pub fn is_peer_fault(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_) | Self::Codec(_))
    }
}
