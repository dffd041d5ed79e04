//! Readiness announcements for an attempt
//!
//! Members that intend to take part in an attempt broadcast an announcement
//! scoped to the attempt's session and collect the announcements of others
//! until the announcement window closes.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcode::{Decode, Encode};
use tessera_core::MemberIndex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::membership::MembershipValidator;
use crate::net::{broadcast, BroadcastChannel, MessageReceiver, NetMessage, Retransmission};

/// Readiness announcement of one seat
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct AnnouncementMessage {
    pub sender_id: MemberIndex,
    pub protocol_id: String,
    pub session_id: String,
}

impl NetMessage for AnnouncementMessage {
    const TYPE: &'static str = "tessera/announcement_message";
}

/// Exchanges readiness announcements for one session
#[async_trait]
pub trait Announcer: Send + Sync {
    /// Announce `member` as ready and return every ready seat, ascending.
    ///
    /// Returns only after `ctx` is cancelled; `member` is always included.
    async fn announce(
        &self,
        ctx: &CancellationToken,
        member: MemberIndex,
        session_id: &str,
    ) -> Result<Vec<MemberIndex>>;
}

/// Announcer running over a group broadcast channel
pub struct BroadcastAnnouncer {
    protocol_id: String,
    group_size: usize,
    channel: Arc<dyn BroadcastChannel>,
    membership: Arc<dyn MembershipValidator>,
    retransmission: Retransmission,
}

impl BroadcastAnnouncer {
    pub fn new(
        protocol_id: impl Into<String>,
        group_size: usize,
        channel: Arc<dyn BroadcastChannel>,
        membership: Arc<dyn MembershipValidator>,
    ) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            group_size,
            channel,
            membership,
            retransmission: Retransmission::Fixed(Duration::from_millis(500)),
        }
    }

    pub fn with_retransmission(mut self, retransmission: Retransmission) -> Self {
        self.retransmission = retransmission;
        self
    }

    fn accepts(
        &self,
        message: &AnnouncementMessage,
        sender_public_key: &[u8],
        session_id: &str,
    ) -> bool {
        let sender = message.sender_id;
        if sender.0 == 0 || usize::from(sender.0) > self.group_size {
            warn!(sender = %sender, "Announcement from out of range member");
            return false;
        }
        if !self
            .membership
            .is_valid_membership(sender, sender_public_key)
        {
            warn!(sender = %sender, "Announcement with invalid membership");
            return false;
        }
        if message.protocol_id != self.protocol_id {
            debug!(sender = %sender, "Announcement for protocol {}", message.protocol_id);
            return false;
        }
        if message.session_id != session_id {
            debug!(sender = %sender, "Announcement for session {}", message.session_id);
            return false;
        }
        true
    }
}

#[async_trait]
impl Announcer for BroadcastAnnouncer {
    async fn announce(
        &self,
        ctx: &CancellationToken,
        member: MemberIndex,
        session_id: &str,
    ) -> Result<Vec<MemberIndex>> {
        // Subscribe before sending so fast peers are not missed
        let mut receiver = MessageReceiver::<AnnouncementMessage>::new(self.channel.as_ref());

        let announcement = AnnouncementMessage {
            sender_id: member,
            protocol_id: self.protocol_id.clone(),
            session_id: session_id.to_string(),
        };
        broadcast(ctx, Arc::clone(&self.channel), &announcement, self.retransmission).await?;

        let mut ready = BTreeSet::from([member]);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                received = receiver.recv() => match received {
                    Some(received) => {
                        if self.accepts(&received.message, &received.sender_public_key, session_id)
                            && ready.insert(received.message.sender_id)
                        {
                            debug!(
                                member = %member,
                                sender = %received.message.sender_id,
                                "Accepted announcement for {}", session_id
                            );
                        }
                    }
                    None => {
                        ctx.cancelled().await;
                        break;
                    }
                },
            }
        }

        Ok(ready.into_iter().collect())
    }
}
