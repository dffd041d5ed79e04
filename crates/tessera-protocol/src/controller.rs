//! Group controllers
//!
//! An operator may hold several seats of a group. Controllers run one retry
//! loop per local seat and fold the seats' outcomes into the operator's
//! view of the run.

use std::sync::Arc;
use std::time::Duration;

use tessera_core::{
    AttemptSchedule, GroupParameters, MemberIndex, OperatorAddress, ProtocolRun,
    RetryLoopResult, RunId, Signature, DEFAULT_SIGNING_ATTEMPTS_LIMIT,
    SIGNING_BATCH_INTERLUDE_BLOCKS,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::announcer::{Announcer, BroadcastAnnouncer};
use crate::chain::{cancel_at_block, wait_for_block, BlockSource};
use crate::done_check::SigningDoneCheck;
use crate::error::{ProtocolError, Result};
use crate::membership::MembershipValidator;
use crate::net::{BroadcastChannel, Retransmission};
use crate::retry_loop::{DkgRetryLoop, RetryLoop, RoundExecutor, SigningAttempts};
use crate::stop_signal::{StopSignaller, DEFAULT_STOP_SIGNAL_DELAY};

/// Protocol id carried by signing announcements
pub const SIGNING_PROTOCOL_ID: &str = "tessera-signing";

/// Protocol id carried by key generation announcements
pub const KEY_GENERATION_PROTOCOL_ID: &str = "tessera-dkg";

/// Local operator's view of a group
#[derive(Clone)]
pub struct GroupContext {
    /// Operator of every seat; seat `i` is at position `i - 1`
    pub operators: Vec<OperatorAddress>,
    pub parameters: GroupParameters,
    /// Seats held by the local operator
    pub local_members: Vec<MemberIndex>,
    pub channel: Arc<dyn BroadcastChannel>,
    pub membership: Arc<dyn MembershipValidator>,
    pub blocks: Arc<dyn BlockSource>,
}

impl GroupContext {
    fn ensure_local_members(&self) -> Result<()> {
        if self.local_members.is_empty() {
            return Err(ProtocolError::InvalidArgument(
                "operator holds no seat in the group".to_string(),
            ));
        }
        Ok(())
    }

    fn announcer(&self, protocol_id: &str, retransmission: Retransmission) -> Arc<dyn Announcer> {
        Arc::new(
            BroadcastAnnouncer::new(
                protocol_id,
                self.parameters.group_size,
                Arc::clone(&self.channel),
                Arc::clone(&self.membership),
            )
            .with_retransmission(retransmission),
        )
    }
}

/// Timing of the group broadcast messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagingConfig {
    pub announcement_retransmission: Retransmission,
    pub done_retransmission: Retransmission,
    pub done_poll_interval: Duration,
    pub stop_signal_delay: Duration,
    pub stop_signal_retransmission_interval: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            announcement_retransmission: Retransmission::Fixed(Duration::from_millis(500)),
            done_retransmission: Retransmission::Backoff {
                initial: Duration::from_millis(250),
                max: Duration::from_secs(4),
            },
            done_poll_interval: Duration::from_millis(500),
            stop_signal_delay: DEFAULT_STOP_SIGNAL_DELAY,
            stop_signal_retransmission_interval: Duration::from_secs(1),
        }
    }
}

/// Signature agreed on by the local seats
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    pub message: RunId,
    pub signature: Signature,
    pub attempt_number: u32,
    pub start_block: u64,
    /// Latest block at which a participant finished the signing
    pub end_block: u64,
    pub active_members_count: usize,
}

/// Runs a signing loop for every local seat
pub struct SigningGroupController<E> {
    group: GroupContext,
    executor: Arc<E>,
    messaging: MessagingConfig,
    attempts_limit: u32,
}

impl<E> SigningGroupController<E>
where
    E: RoundExecutor<Output = Signature> + 'static,
{
    pub fn new(group: GroupContext, executor: Arc<E>) -> Self {
        Self {
            group,
            executor,
            messaging: MessagingConfig::default(),
            attempts_limit: DEFAULT_SIGNING_ATTEMPTS_LIMIT,
        }
    }

    pub fn with_messaging(mut self, messaging: MessagingConfig) -> Self {
        self.messaging = messaging;
        self
    }

    pub fn with_attempts_limit(mut self, attempts_limit: u32) -> Self {
        self.attempts_limit = attempts_limit;
        self
    }

    /// Sign `message` with every local seat, first attempt starting at
    /// `start_block`.
    ///
    /// All local seats must reach the same signature; diverging outcomes are
    /// an error.
    pub async fn sign(
        &self,
        ctx: &CancellationToken,
        message: RunId,
        start_block: u64,
    ) -> Result<SignedMessage> {
        self.group.ensure_local_members()?;
        let run = Arc::new(ProtocolRun::new(
            message.clone(),
            self.group.operators.clone(),
            self.group.parameters,
            start_block,
        )?);

        let loop_timeout_block = start_block.saturating_add(
            u64::from(self.attempts_limit) * AttemptSchedule::SIGNING.max_attempt_blocks(),
        );
        let loop_ctx = cancel_at_block(ctx, Arc::clone(&self.group.blocks), loop_timeout_block);
        let announcer = self
            .group
            .announcer(SIGNING_PROTOCOL_ID, self.messaging.announcement_retransmission);

        info!(
            message = %message,
            seats = self.group.local_members.len(),
            "Starting signing at block {} (loop timeout block {})",
            start_block,
            loop_timeout_block
        );

        let mut signers = JoinSet::new();
        for &member in &self.group.local_members {
            let done_check = SigningDoneCheck::new(
                Arc::clone(&self.group.channel),
                Arc::clone(&self.group.membership),
            )
            .with_poll_interval(self.messaging.done_poll_interval)
            .with_retransmission(self.messaging.done_retransmission);
            let retry_loop = RetryLoop::new(
                Arc::clone(&run),
                member,
                Arc::clone(&announcer),
                Arc::clone(&self.group.blocks),
                Arc::clone(&self.executor),
                SigningAttempts::new(Arc::new(done_check)),
            );
            let loop_ctx = loop_ctx.clone();
            signers.spawn(async move { (member, retry_loop.start(&loop_ctx).await) });
        }

        let mut outcomes = Vec::with_capacity(self.group.local_members.len());
        while let Some(joined) = signers.join_next().await {
            outcomes.push(joined?);
        }
        outcomes.sort_by_key(|(member, _)| *member);

        // Loop context closed by the timeout block rather than the caller
        let timed_out = loop_ctx.is_cancelled() && !ctx.is_cancelled();
        let outcomes = outcomes
            .into_iter()
            .map(|(member, outcome)| match outcome {
                Err(ProtocolError::Cancelled) if timed_out => {
                    (member, Err(ProtocolError::AttemptsLimitReached(self.attempts_limit)))
                }
                other => (member, other),
            })
            .collect();

        match compact_outcomes(outcomes) {
            Ok(result) => {
                // Peers may still need our done records until the attempt ends
                let guard = loop_ctx.clone();
                let blocks = Arc::clone(&self.group.blocks);
                let timeout_block = result.attempt_timeout_block;
                tokio::spawn(async move {
                    let _ = wait_for_block(&guard, blocks.as_ref(), timeout_block).await;
                    guard.cancel();
                });

                info!(
                    message = %message,
                    attempt = result.attempt_number,
                    "Signed with {} active members; end block {}",
                    result.active_members_count,
                    result.latest_end_block
                );
                Ok(SignedMessage {
                    message,
                    signature: result.result,
                    attempt_number: result.attempt_number,
                    start_block,
                    end_block: result.latest_end_block,
                    active_members_count: result.active_members_count,
                })
            }
            Err(e) => {
                loop_ctx.cancel();
                warn!(message = %message, "Signing failed: {}", e);
                Err(e)
            }
        }
    }

    /// Sign `messages` one after another; each signing starts shortly after
    /// the previous one ended
    pub async fn sign_batch(
        &self,
        ctx: &CancellationToken,
        messages: &[RunId],
        start_block: u64,
    ) -> Result<Vec<SignedMessage>> {
        let mut signed = Vec::with_capacity(messages.len());
        let mut next_start_block = start_block;
        for message in messages {
            let result = self.sign(ctx, message.clone(), next_start_block).await?;
            next_start_block = result.end_block + SIGNING_BATCH_INTERLUDE_BLOCKS;
            signed.push(result);
        }
        Ok(signed)
    }
}

/// Fold the outcomes of all local seats into one
fn compact_outcomes(
    outcomes: Vec<(MemberIndex, Result<RetryLoopResult<Signature>>)>,
) -> Result<RetryLoopResult<Signature>> {
    let (successes, failures): (Vec<_>, Vec<_>) =
        outcomes.into_iter().partition(|(_, outcome)| outcome.is_ok());
    let successes: Vec<_> = successes
        .into_iter()
        .filter_map(|(member, outcome)| outcome.ok().map(|result| (member, result)))
        .collect();
    let failures: Vec<_> = failures
        .into_iter()
        .filter_map(|(member, outcome)| outcome.err().map(|err| (member, err)))
        .collect();

    if !successes.is_empty() && !failures.is_empty() {
        let failed: Vec<String> = failures
            .iter()
            .map(|(member, err)| format!("seat {member}: {err}"))
            .collect();
        return Err(ProtocolError::DivergentOutcomes(format!(
            "{} seats signed, {} failed [{}]",
            successes.len(),
            failures.len(),
            failed.join("; ")
        )));
    }

    if let Some(((first_member, first), rest)) = successes.split_first() {
        for (member, result) in rest {
            if result.result != first.result
                || result.attempt_number != first.attempt_number
                || result.latest_end_block != first.latest_end_block
            {
                return Err(ProtocolError::DivergentOutcomes(format!(
                    "seat {} signed {} in attempt {}, seat {} signed {} in attempt {}",
                    first_member,
                    first.result.to_hex(),
                    first.attempt_number,
                    member,
                    result.result.to_hex(),
                    result.attempt_number
                )));
            }
        }
        return Ok(first.clone());
    }

    let mut failures = failures.into_iter();
    let Some((_, first)) = failures.next() else {
        return Err(ProtocolError::InvalidArgument(
            "no signing outcomes".to_string(),
        ));
    };
    let message = first.to_string();
    let mut divergent = Vec::new();
    for (member, err) in failures {
        let other = err.to_string();
        if other != message {
            divergent.push(format!("seat {member}: {other}"));
        }
    }
    if divergent.is_empty() {
        if matches!(first, ProtocolError::Cancelled) {
            return Err(ProtocolError::Cancelled);
        }
        return Err(ProtocolError::SignersFailed(message));
    }
    Err(ProtocolError::DivergentOutcomes(format!(
        "{}; {}",
        message,
        divergent.join("; ")
    )))
}

/// Key generation outcome of one local seat
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyGenerationOutcome<R> {
    /// The seat produced a result
    Generated(RetryLoopResult<R>),
    /// Another member finished first and signalled the group to stop
    Stopped,
    Failed(String),
}

impl<R> KeyGenerationOutcome<R> {
    pub fn is_generated(&self) -> bool {
        matches!(self, KeyGenerationOutcome::Generated(_))
    }
}

/// Runs a key generation loop for every local seat
pub struct DkgGroupController<E> {
    group: GroupContext,
    executor: Arc<E>,
    messaging: MessagingConfig,
}

impl<E> DkgGroupController<E>
where
    E: RoundExecutor + 'static,
{
    pub fn new(group: GroupContext, executor: Arc<E>) -> Self {
        Self {
            group,
            executor,
            messaging: MessagingConfig::default(),
        }
    }

    pub fn with_messaging(mut self, messaging: MessagingConfig) -> Self {
        self.messaging = messaging;
        self
    }

    /// Run key generation for `seed` on every local seat.
    ///
    /// Seats report their outcomes individually, ordered by seat.
    pub async fn generate(
        &self,
        ctx: &CancellationToken,
        seed: RunId,
        start_block: u64,
    ) -> Result<Vec<(MemberIndex, KeyGenerationOutcome<E::Output>)>> {
        self.group.ensure_local_members()?;
        let run = Arc::new(ProtocolRun::new(
            seed.clone(),
            self.group.operators.clone(),
            self.group.parameters,
            start_block,
        )?);
        let announcer = self
            .group
            .announcer(KEY_GENERATION_PROTOCOL_ID, self.messaging.announcement_retransmission);
        let stop = StopSignaller::new(
            self.group.parameters.group_size,
            Arc::clone(&self.group.channel),
            Arc::clone(&self.group.membership),
        )
        .with_delay(self.messaging.stop_signal_delay)
        .with_retransmission_interval(self.messaging.stop_signal_retransmission_interval);

        info!(
            seed = %seed,
            seats = self.group.local_members.len(),
            "Starting key generation at block {}",
            start_block
        );

        let mut members = JoinSet::new();
        for &member in &self.group.local_members {
            let retry_loop = DkgRetryLoop::new(
                Arc::clone(&run),
                member,
                Arc::clone(&announcer),
                Arc::clone(&self.group.blocks),
                Arc::clone(&self.executor),
                stop.clone(),
            );
            let ctx = ctx.clone();
            members.spawn(async move { (member, retry_loop.start(&ctx).await) });
        }

        let mut outcomes = Vec::with_capacity(self.group.local_members.len());
        while let Some(joined) = members.join_next().await {
            let (member, outcome) = joined?;
            let outcome = match outcome {
                Ok(Some(result)) => {
                    info!(
                        seed = %seed,
                        member = %member,
                        "Generated key in attempt {}",
                        result.attempt_number
                    );
                    KeyGenerationOutcome::Generated(result)
                }
                Ok(None) => KeyGenerationOutcome::Stopped,
                Err(e) => {
                    warn!(seed = %seed, member = %member, "Key generation failed: {}", e);
                    KeyGenerationOutcome::Failed(e.to_string())
                }
            };
            outcomes.push((member, outcome));
        }

        if ctx.is_cancelled() && !outcomes.iter().any(|(_, outcome)| outcome.is_generated()) {
            return Err(ProtocolError::Cancelled);
        }
        outcomes.sort_by_key(|(member, _)| *member);
        Ok(outcomes)
    }
}
