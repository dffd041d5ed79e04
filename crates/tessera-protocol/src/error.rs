//! Error types for group protocol coordination

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur while coordinating attempts
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] tessera_core::Error),

    /// Network error
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Block source error
    #[error("Block source error: {0}")]
    Block(String),

    /// The round executor failed
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Participant selection failed for the attempt
    #[error("Random operator selection failed: {0}")]
    Selection(tessera_core::Error),

    /// Done records carry different signatures
    #[error("Not matching signatures detected; result: {expected}, other result: {found}")]
    SignaturesMismatch { expected: String, found: String },

    /// Not every participant reported completion in time
    #[error("Done check incomplete; missing members: {missing:?}")]
    DoneCheckIncomplete { missing: Vec<u8> },

    /// Local seats reported different outcomes
    #[error("Signers came to different outcomes: {0}")]
    DivergentOutcomes(String),

    /// No attempt succeeded before the loop timeout block
    #[error("No attempt succeeded within the limit of {0} attempts")]
    AttemptsLimitReached(u32),

    /// Every local seat failed with the same error
    #[error("Signers failed: {0}")]
    SignersFailed(String),

    /// A spawned task panicked or was aborted
    #[error("Task failed: {0}")]
    Task(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,
}

/// Errors raised by broadcast channels
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("Message type not registered: {0}")]
    UnregisteredType(String),

    #[error("Channel closed: {0}")]
    Closed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bitcode::Error> for NetworkError {
    fn from(e: bitcode::Error) -> Self {
        NetworkError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ProtocolError {
    fn from(e: tokio::task::JoinError) -> Self {
        ProtocolError::Task(e.to_string())
    }
}
