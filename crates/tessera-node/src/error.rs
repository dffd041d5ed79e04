//! Error types for the Tessera node

use thiserror::Error;

/// Result type alias for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

/// Errors that can occur in the node
#[derive(Debug, Error)]
pub enum NodeError {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] tessera_core::Error),

    /// Protocol coordination error
    #[error("Protocol error: {0}")]
    Protocol(#[from] tessera_protocol::ProtocolError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::Serialization(e.to_string())
    }
}
