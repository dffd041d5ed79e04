//! Simulated key generation and signing rounds
//!
//! The devnet has no real threshold cryptography. Rounds take a configured
//! number of blocks and produce outputs every participant derives the same
//! way, so agreement between members can be checked. A round fails for
//! everyone when a faulty seat takes part in it, as a broken share would.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tessera_core::{MemberIndex, Signature};
use tessera_protocol::{
    wait_for_block, BlockSource, ProtocolError, RoundExecutor, RoundRequest,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Group key produced by a simulated key generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedKey {
    /// Hex encoded group public key
    pub public_key: String,
    /// Seats that took part in the successful round
    pub participants: Vec<MemberIndex>,
}

/// Shared behaviour of the simulated rounds
#[derive(Clone)]
struct SimulatedRound {
    blocks: Arc<dyn BlockSource>,
    round_blocks: u64,
    faulty: BTreeSet<MemberIndex>,
}

impl SimulatedRound {
    /// Wait out the round and check for faulty participants
    async fn run(
        &self,
        ctx: &CancellationToken,
        request: &RoundRequest,
    ) -> tessera_protocol::Result<Vec<MemberIndex>> {
        let participants = request.attempt.included_members(request.group_size);
        let end_block = request.attempt.start_block + self.round_blocks;
        wait_for_block(ctx, self.blocks.as_ref(), end_block).await?;

        let faulty: Vec<_> = participants
            .iter()
            .filter(|member| self.faulty.contains(member))
            .collect();
        if !faulty.is_empty() {
            debug!(
                member = %request.member,
                session = %request.session_id,
                "Round broken by faulty seats {:?}",
                faulty
            );
            return Err(ProtocolError::Execution(format!(
                "invalid shares from seats {faulty:?}"
            )));
        }
        Ok(participants)
    }
}

fn digest(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Simulated distributed key generation
#[derive(Clone)]
pub struct SimulatedKeyGenerator {
    round: SimulatedRound,
}

impl SimulatedKeyGenerator {
    pub fn new(
        blocks: Arc<dyn BlockSource>,
        round_blocks: u64,
        faulty: BTreeSet<MemberIndex>,
    ) -> Self {
        Self {
            round: SimulatedRound {
                blocks,
                round_blocks,
                faulty,
            },
        }
    }
}

#[async_trait]
impl RoundExecutor for SimulatedKeyGenerator {
    type Output = GeneratedKey;

    async fn execute(
        &self,
        ctx: &CancellationToken,
        request: RoundRequest,
    ) -> tessera_protocol::Result<GeneratedKey> {
        let participants = self.round.run(ctx, &request).await?;
        let seats: Vec<u8> = participants.iter().map(|member| member.0).collect();
        let public_key = digest(&[b"tessera-dkg".as_slice(), request.run_id.as_bytes(), seats.as_slice()]);
        Ok(GeneratedKey {
            public_key: hex::encode(public_key),
            participants,
        })
    }
}

/// Simulated threshold signing
#[derive(Clone)]
pub struct SimulatedSigner {
    round: SimulatedRound,
    /// Group key the signatures are bound to
    group_key: Vec<u8>,
}

impl SimulatedSigner {
    pub fn new(
        blocks: Arc<dyn BlockSource>,
        round_blocks: u64,
        faulty: BTreeSet<MemberIndex>,
        group_key: Vec<u8>,
    ) -> Self {
        Self {
            round: SimulatedRound {
                blocks,
                round_blocks,
                faulty,
            },
            group_key,
        }
    }
}

#[async_trait]
impl RoundExecutor for SimulatedSigner {
    type Output = Signature;

    async fn execute(
        &self,
        ctx: &CancellationToken,
        request: RoundRequest,
    ) -> tessera_protocol::Result<Signature> {
        self.round.run(ctx, &request).await?;
        let message = request.run_id.as_bytes();
        let r = digest(&[b"r".as_slice(), self.group_key.as_slice(), message]);
        let s = digest(&[b"s".as_slice(), self.group_key.as_slice(), message]);
        Ok(Signature::new(r, s, r[31] & 1))
    }
}
