//! Error types for mesh-p2p.

use std::net::SocketAddr;

use thiserror::Error;

use crate::protocol::{ConnectionId, NodeId};

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum P2pError {
    /// Send targeted a connection that is not (or no longer) registered.
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Send targeted a node that is not a current neighbor.
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    /// The outbound queue of a connection is full.
    #[error("outbound queue full for connection {0}")]
    Backpressure(ConnectionId),

    /// A listener is already bound.
    #[error("already listening on {0}")]
    AlreadyListening(SocketAddr),

    /// An outbound connect attempt did not complete in time.
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    /// Failed to serialize or deserialize a frame.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),

    /// The mesh event loop has stopped.
    #[error("mesh has shut down")]
    Shutdown,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for P2pError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for mesh operations.
pub type P2pResult<T> = Result<T, P2pError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_connection_display() {
        let id = ConnectionId::new();
        let err = P2pError::UnknownConnection(id);
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn unknown_node_display() {
        let err = P2pError::UnknownNode(NodeId::from("node-b"));
        assert_eq!(err.to_string(), "unknown node: node-b");
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: P2pError = json_err.into();
        assert!(matches!(err, P2pError::Serialization(_)));
    }

    #[test]
    fn shutdown_display() {
        assert_eq!(P2pError::Shutdown.to_string(), "mesh has shut down");
    }
}
