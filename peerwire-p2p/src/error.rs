//! P2P error types.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use crate::peer::NodeId;

/// P2P-specific errors.
#[derive(Debug, Error)]
pub enum P2pError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Frame header failed structural parsing.
    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// Frame body is not valid UTF-8 JSON or is not a well-formed message.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Stream ended before the declared body length arrived.
    #[error("Truncated stream: expected {expected} body bytes, received {received}")]
    TruncatedStream { expected: usize, received: usize },

    /// Payload could not be serialized to JSON.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Frame exceeds maximum allowed size.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Handshake rejected (ordering rule, closed transport).
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Peer's declared node id does not match its listening port.
    #[error("Invalid identity: node id {node_id} does not match listen port {listen_port}")]
    InvalidIdentity { node_id: u64, listen_port: u64 },

    /// Handshake timed out.
    #[error("Handshake timeout")]
    HandshakeTimeout,

    /// Peer sent an unexpected message.
    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage { expected: String, actual: String },

    /// Connection to our own node id.
    #[error("Refusing connection to self")]
    SelfConnection,

    /// Connection timed out.
    #[error("Connection timeout to {addr}")]
    ConnectionTimeout { addr: SocketAddr },

    /// No registered connection to the peer.
    #[error("Not connected to {0}")]
    UnknownPeer(NodeId),

    /// Connection already closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Node is shutting down.
    #[error("Node shutting down")]
    Shutdown,
}

impl P2pError {
    /// Whether the error stems from a peer violating the wire format.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            P2pError::MalformedFrame { .. }
                | P2pError::InvalidPayload(_)
                | P2pError::MessageTooLarge { .. }
        )
    }

    /// Whether the error rejects a handshake.
    pub fn is_handshake_rejection(&self) -> bool {
        matches!(
            self,
            P2pError::HandshakeRejected(_)
                | P2pError::InvalidIdentity { .. }
                | P2pError::HandshakeTimeout
                | P2pError::UnexpectedMessage { .. }
                | P2pError::SelfConnection
        )
    }
}

/// Result type for P2P operations.
pub type P2pResult<T> = Result<T, P2pError>;
