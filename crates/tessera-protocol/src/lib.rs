//! Tessera Protocol - Leaderless multi-attempt coordination for threshold groups
//!
//! Members of a threshold group run key generation and signing without a
//! coordinator. Each member evaluates the same block-scheduled attempts and
//! the same seeded participant selection, so retries converge without any
//! extra agreement round.
//!
//! # Layout
//!
//! - [`chain`]: block height source and block-bound cancellation
//! - [`net`]: broadcast channel abstraction and typed messages
//! - [`announcer`]: readiness announcements
//! - [`done_check`]: signing completion confirmation
//! - [`stop_signal`]: key generation stop signal
//! - [`retry_loop`]: the per-seat attempt loop
//! - [`controller`]: per-operator controllers over all local seats
//! - [`local`]: in-process network and block counter

pub mod announcer;
pub mod chain;
pub mod controller;
pub mod done_check;
pub mod error;
pub mod local;
pub mod membership;
pub mod net;
pub mod retry_loop;
pub mod stop_signal;

pub use announcer::{AnnouncementMessage, Announcer, BroadcastAnnouncer};
pub use chain::{cancel_at_block, wait_for_block, BlockSource};
pub use controller::{
    DkgGroupController, GroupContext, KeyGenerationOutcome, MessagingConfig, SignedMessage,
    SigningGroupController, KEY_GENERATION_PROTOCOL_ID, SIGNING_PROTOCOL_ID,
};
pub use done_check::{DoneCheckStrategy, DoneRecord, SigningDoneCheck};
pub use error::{NetworkError, ProtocolError, Result};
pub use local::{LocalBlockCounter, LocalChannel, LocalNetwork};
pub use membership::{MembershipValidator, StaticMembershipValidator};
pub use net::{broadcast, BroadcastChannel, Envelope, MessageReceiver, NetMessage, Received, Retransmission};
pub use retry_loop::{
    AttemptProtocol, AttemptScope, Concluded, Conclusion, DkgRetryLoop, Executed,
    KeyGenerationAttempts, RetryLoop, RoundExecutor, RoundRequest, SigningAttempts,
    SigningRetryLoop,
};
pub use stop_signal::{StopSignal, StopSignaller, DEFAULT_STOP_SIGNAL_DELAY};
