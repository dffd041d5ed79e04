//! Signing completion confirmation
//!
//! After a signing round, every participant broadcasts a done record with
//! the signature it computed and the block at which it finished. A member
//! returns the signature only once every participant of the attempt has
//! reported, and all reports agree.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcode::{Decode, Encode};
use tessera_core::{MemberIndex, RunId, Signature};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};
use crate::membership::MembershipValidator;
use crate::net::{broadcast, BroadcastChannel, MessageReceiver, NetMessage, Retransmission};

/// Attestation that a participant completed a signing attempt
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct DoneRecord {
    pub sender_id: MemberIndex,
    pub message: RunId,
    pub attempt_number: u32,
    pub signature: Option<Signature>,
    pub end_block: u64,
}

impl NetMessage for DoneRecord {
    const TYPE: &'static str = "tessera/signing_done_message";
}

/// Way of confirming that every participant completed the attempt
#[async_trait]
pub trait DoneCheckStrategy: Send + Sync {
    /// Start collecting done records of an attempt. Must be called before the
    /// round starts; collection stops when `ctx` is cancelled.
    async fn listen(
        &self,
        ctx: &CancellationToken,
        message: &RunId,
        attempt_number: u32,
        timeout_block: u64,
        participants: &[MemberIndex],
    );

    /// Record and broadcast the local outcome of the attempt
    async fn signal_done(
        &self,
        ctx: &CancellationToken,
        member: MemberIndex,
        message: &RunId,
        attempt_number: u32,
        signature: Signature,
        end_block: u64,
    ) -> Result<()>;

    /// Common signature and the latest end block among all participants
    async fn wait_until_all_done(&self, ctx: &CancellationToken) -> Result<(Signature, u64)>;
}

struct AttemptRecords {
    message: RunId,
    attempt_number: u32,
    timeout_block: u64,
    participants: BTreeSet<MemberIndex>,
    records: Mutex<BTreeMap<MemberIndex, DoneRecord>>,
}

impl AttemptRecords {
    async fn accept(
        &self,
        record: DoneRecord,
        sender_public_key: &[u8],
        membership: &dyn MembershipValidator,
    ) -> bool {
        let sender = record.sender_id;
        let mut records = self.records.lock().await;
        if records.contains_key(&sender) {
            return false;
        }
        if !self.participants.contains(&sender) {
            debug!(sender = %sender, "Done record from a non-participant");
            return false;
        }
        if !membership.is_valid_membership(sender, sender_public_key) {
            warn!(sender = %sender, "Done record with invalid membership");
            return false;
        }
        if record.message != self.message || record.attempt_number != self.attempt_number {
            debug!(sender = %sender, "Done record for another signing");
            return false;
        }
        if record.end_block > self.timeout_block {
            warn!(
                sender = %sender,
                "Done record end block {} past the attempt timeout {}",
                record.end_block,
                self.timeout_block
            );
            return false;
        }
        if record.signature.is_none() {
            warn!(sender = %sender, "Done record without a signature");
            return false;
        }
        records.insert(sender, record);
        true
    }
}

/// Done check over the group broadcast channel
pub struct SigningDoneCheck {
    channel: Arc<dyn BroadcastChannel>,
    membership: Arc<dyn MembershipValidator>,
    poll_interval: Duration,
    retransmission: Retransmission,
    current: RwLock<Option<Arc<AttemptRecords>>>,
}

impl SigningDoneCheck {
    pub fn new(
        channel: Arc<dyn BroadcastChannel>,
        membership: Arc<dyn MembershipValidator>,
    ) -> Self {
        Self {
            channel,
            membership,
            poll_interval: Duration::from_millis(500),
            retransmission: Retransmission::Backoff {
                initial: Duration::from_millis(250),
                max: Duration::from_secs(4),
            },
            current: RwLock::new(None),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retransmission(mut self, retransmission: Retransmission) -> Self {
        self.retransmission = retransmission;
        self
    }

    async fn current(&self) -> Result<Arc<AttemptRecords>> {
        self.current.read().await.clone().ok_or_else(|| {
            ProtocolError::InvalidArgument("done check is not listening".to_string())
        })
    }
}

#[async_trait]
impl DoneCheckStrategy for SigningDoneCheck {
    async fn listen(
        &self,
        ctx: &CancellationToken,
        message: &RunId,
        attempt_number: u32,
        timeout_block: u64,
        participants: &[MemberIndex],
    ) {
        let attempt = Arc::new(AttemptRecords {
            message: message.clone(),
            attempt_number,
            timeout_block,
            participants: participants.iter().copied().collect(),
            records: Mutex::new(BTreeMap::new()),
        });
        *self.current.write().await = Some(Arc::clone(&attempt));

        let mut receiver = MessageReceiver::<DoneRecord>::new(self.channel.as_ref());
        let membership = Arc::clone(&self.membership);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    received = receiver.recv() => match received {
                        Some(received) => {
                            attempt
                                .accept(received.message, &received.sender_public_key, membership.as_ref())
                                .await;
                        }
                        None => break,
                    },
                }
            }
        });
    }

    async fn signal_done(
        &self,
        ctx: &CancellationToken,
        member: MemberIndex,
        message: &RunId,
        attempt_number: u32,
        signature: Signature,
        end_block: u64,
    ) -> Result<()> {
        let record = DoneRecord {
            sender_id: member,
            message: message.clone(),
            attempt_number,
            signature: Some(signature),
            end_block,
        };

        let attempt = self.current().await?;
        if attempt.message == record.message && attempt.attempt_number == attempt_number {
            attempt
                .records
                .lock()
                .await
                .entry(member)
                .or_insert_with(|| record.clone());
        }

        broadcast(ctx, Arc::clone(&self.channel), &record, self.retransmission).await?;
        Ok(())
    }

    async fn wait_until_all_done(&self, ctx: &CancellationToken) -> Result<(Signature, u64)> {
        let attempt = self.current().await?;
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    let records = attempt.records.lock().await;
                    let missing = attempt
                        .participants
                        .iter()
                        .filter(|member| !records.contains_key(member))
                        .map(|member| member.0)
                        .collect();
                    return Err(ProtocolError::DoneCheckIncomplete { missing });
                }
                _ = ticker.tick() => {}
            }

            let records = attempt.records.lock().await;
            if records.len() < attempt.participants.len() {
                continue;
            }

            let mut signatures = records.values().filter_map(|record| record.signature);
            let Some(expected) = signatures.next() else {
                continue;
            };
            if let Some(found) = signatures.find(|signature| *signature != expected) {
                return Err(ProtocolError::SignaturesMismatch {
                    expected: expected.to_hex(),
                    found: found.to_hex(),
                });
            }

            let latest_end_block = records
                .values()
                .map(|record| record.end_block)
                .max()
                .unwrap_or_default();
            return Ok((expected, latest_end_block));
        }
    }
}
