//! Tessera Core - Shared types, attempt scheduling, and participant selection
//!
//! This crate provides the deterministic building blocks every member of a
//! threshold group evaluates locally:
//! - Seat, operator, run and signature types
//! - Group parameters and seat bookkeeping
//! - Block windows of key generation and signing attempts
//! - Seeded participant selection for retried attempts

pub mod attempt;
pub mod error;
pub mod group;
pub mod retry;
pub mod rng;
pub mod schedule;
pub mod selection;
pub mod types;

pub use attempt::{AttemptParams, ProtocolRun, RetryLoopResult};
pub use error::{Error, Result};
pub use group::{unready_members, GroupParameters};
pub use retry::{
    evaluate_retry_participants_for_key_generation, evaluate_retry_participants_for_signing,
};
pub use rng::{attempt_seed, SelectionRng};
pub use schedule::{AttemptSchedule, AttemptWindow};
pub use selection::{key_generation_excluded_members, signing_excluded_members};
pub use types::{MemberIndex, OperatorAddress, RunId, Signature};

/// Blocks between two consecutive signings of a batch
pub const SIGNING_BATCH_INTERLUDE_BLOCKS: u64 = 2;

/// Default number of signing attempts before a signing is abandoned
pub const DEFAULT_SIGNING_ATTEMPTS_LIMIT: u32 = 5;
