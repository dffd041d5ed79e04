//! Key generation stop signal
//!
//! A member that produced a key generation result broadcasts a stop signal
//! after a grace period. Members still retrying the same run stop their loop
//! once they receive a valid signal.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcode::{Decode, Encode};
use tessera_core::{MemberIndex, RunId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::{cancel_at_block, BlockSource};
use crate::membership::MembershipValidator;
use crate::net::{broadcast, BroadcastChannel, MessageReceiver, NetMessage, Retransmission};

/// Default grace period before the signal is sent
pub const DEFAULT_STOP_SIGNAL_DELAY: Duration = Duration::from_secs(60);

/// Announces that a key generation attempt of a run succeeded
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StopSignal {
    pub sender_id: MemberIndex,
    pub run_id: RunId,
    pub attempt_number: u32,
}

impl NetMessage for StopSignal {
    const TYPE: &'static str = "tessera/dkg_stop_signal";
}

/// Sends and receives stop signals over the group broadcast channel
#[derive(Clone)]
pub struct StopSignaller {
    group_size: usize,
    channel: Arc<dyn BroadcastChannel>,
    membership: Arc<dyn MembershipValidator>,
    delay: Duration,
    retransmission_interval: Duration,
}

impl StopSignaller {
    pub fn new(
        group_size: usize,
        channel: Arc<dyn BroadcastChannel>,
        membership: Arc<dyn MembershipValidator>,
    ) -> Self {
        Self {
            group_size,
            channel,
            membership,
            delay: DEFAULT_STOP_SIGNAL_DELAY,
            retransmission_interval: Duration::from_secs(1),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_retransmission_interval(mut self, interval: Duration) -> Self {
        self.retransmission_interval = interval;
        self
    }

    /// Watch for stop signals of `run_id`.
    ///
    /// Returns a child of `ctx` that is cancelled when a member sends a valid
    /// signal for an attempt not later than `current_attempt`.
    pub fn listen(
        &self,
        ctx: &CancellationToken,
        run_id: &RunId,
        current_attempt: Arc<AtomicU32>,
    ) -> CancellationToken {
        let stopped = ctx.child_token();
        let mut receiver = MessageReceiver::<StopSignal>::new(self.channel.as_ref());
        let membership = Arc::clone(&self.membership);
        let group_size = self.group_size;
        let run_id = run_id.clone();
        let token = stopped.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = receiver.recv() => {
                        let Some(received) = received else { break };
                        let signal = received.message;
                        let sender = signal.sender_id;
                        if sender.0 == 0 || usize::from(sender.0) > group_size {
                            warn!(sender = %sender, "Stop signal from out of range member");
                            continue;
                        }
                        if !membership.is_valid_membership(sender, &received.sender_public_key) {
                            warn!(sender = %sender, "Stop signal with invalid membership");
                            continue;
                        }
                        if signal.run_id != run_id {
                            debug!(sender = %sender, "Stop signal for run {}", signal.run_id);
                            continue;
                        }
                        let attempt = current_attempt.load(Ordering::SeqCst);
                        if signal.attempt_number > attempt {
                            debug!(
                                sender = %sender,
                                "Stop signal for attempt {} while in attempt {}",
                                signal.attempt_number,
                                attempt
                            );
                            continue;
                        }
                        info!(
                            sender = %sender,
                            attempt = signal.attempt_number,
                            "Received stop signal for run {}", run_id
                        );
                        token.cancel();
                        break;
                    }
                }
            }
        });

        stopped
    }

    /// Broadcast a stop signal after the grace period, re-sending it until
    /// the chain reaches `until_block` or `ctx` is cancelled
    pub fn schedule(
        &self,
        ctx: &CancellationToken,
        blocks: Arc<dyn BlockSource>,
        member: MemberIndex,
        run_id: &RunId,
        attempt_number: u32,
        until_block: u64,
    ) {
        let window = cancel_at_block(ctx, blocks, until_block);
        let signal = StopSignal {
            sender_id: member,
            run_id: run_id.clone(),
            attempt_number,
        };
        // Registering up front lets the first send through
        self.channel.register_message_type(StopSignal::TYPE);
        let channel = Arc::clone(&self.channel);
        let delay = self.delay;
        let retransmission = Retransmission::Fixed(self.retransmission_interval);

        tokio::spawn(async move {
            tokio::select! {
                _ = window.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            debug!(member = %member, attempt = attempt_number, "Sending stop signal");
            if let Err(e) = broadcast(&window, channel, &signal, retransmission).await {
                warn!(member = %member, "Failed to send stop signal: {}", e);
            }
        });
    }
}
