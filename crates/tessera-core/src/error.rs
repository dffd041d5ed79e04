//! Error types for the Tessera core library

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid group parameters: {0}")]
    InvalidParameters(String),

    #[error("Invalid member index: {0}")]
    InvalidMemberIndex(String),

    #[error("Asked for too many seats: {requested} requested, {available} available")]
    TooManySeats { requested: usize, available: usize },

    #[error(
        "Retry count [{retry_count}] exceeds the number of candidates; \
         tried every single, pair, and triplet, {remaining} retries left over"
    )]
    RetryExhausted { retry_count: u64, remaining: u64 },

    #[error("Invalid attempt number: {0}")]
    InvalidAttempt(u32),

    #[error("Invalid run identifier: {0}")]
    InvalidRunId(String),
}
