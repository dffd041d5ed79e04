//! Local devnet
//!
//! Runs every configured operator inside one process over a [`LocalNetwork`]
//! and a ticking [`LocalBlockCounter`]: key generation first, then a signing
//! batch under the generated key.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tessera_core::{MemberIndex, OperatorAddress, RunId};
use tessera_protocol::{
    DkgGroupController, GroupContext, KeyGenerationOutcome, LocalBlockCounter, LocalNetwork,
    SigningGroupController, StaticMembershipValidator,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::executor::{SimulatedKeyGenerator, SimulatedSigner};

/// Key generation outcome of one seat
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SeatKeyGeneration {
    Generated {
        member: MemberIndex,
        attempt: u32,
        public_key: String,
        participants: Vec<MemberIndex>,
    },
    Stopped {
        member: MemberIndex,
    },
    Failed {
        member: MemberIndex,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyGenerationReport {
    pub operator: String,
    pub seats: Vec<SeatKeyGeneration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureReport {
    pub message: String,
    pub signature: String,
    pub attempt: u32,
    pub start_block: u64,
    pub end_block: u64,
    pub active_members: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SigningReport {
    pub operator: String,
    pub signatures: Vec<SignatureReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DevnetReport {
    pub group_public_key: String,
    pub key_generation: Vec<KeyGenerationReport>,
    pub signing: Vec<SigningReport>,
}

struct DevnetOperator {
    name: String,
    members: Vec<MemberIndex>,
    offline: bool,
}

/// In-process group of operators
pub struct Devnet {
    config: NodeConfig,
    network: LocalNetwork,
    blocks: Arc<LocalBlockCounter>,
    roster: Vec<OperatorAddress>,
    operators: Vec<DevnetOperator>,
    faulty: BTreeSet<MemberIndex>,
}

impl Devnet {
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let mut roster = Vec::with_capacity(config.group.group_size);
        let mut operators = Vec::with_capacity(config.operators.len());
        for (operator, members) in config.seat_assignments() {
            let address = OperatorAddress::from_public_key(operator.name.as_bytes());
            roster.extend(members.iter().map(|_| address.clone()));
            operators.push(DevnetOperator {
                name: operator.name.clone(),
                members,
                offline: operator.offline,
            });
        }

        Ok(Self {
            faulty: config.faulty_members(),
            network: LocalNetwork::new("tessera-devnet"),
            blocks: LocalBlockCounter::new(0),
            roster,
            operators,
            config,
        })
    }

    pub fn blocks(&self) -> Arc<LocalBlockCounter> {
        Arc::clone(&self.blocks)
    }

    /// Start producing blocks until `ctx` is cancelled
    pub fn start_chain(&self, ctx: &CancellationToken) {
        self.blocks
            .spawn_ticker(self.config.timing.block_time(), ctx.clone());
    }

    fn context(&self, operator: &DevnetOperator) -> GroupContext {
        GroupContext {
            operators: self.roster.clone(),
            parameters: self.config.group_parameters(),
            local_members: operator.members.clone(),
            channel: self.network.channel(operator.name.as_bytes().to_vec()),
            membership: Arc::new(StaticMembershipValidator::new(self.roster.clone())),
            blocks: self.blocks.clone(),
        }
    }

    fn online(&self) -> impl Iterator<Item = &DevnetOperator> {
        self.operators.iter().filter(|operator| !operator.offline)
    }

    fn start_block(&self) -> u64 {
        self.blocks.height() + self.config.scenario.start_delay_blocks
    }

    /// Run key generation on every online operator
    pub async fn run_key_generation(
        &self,
        ctx: &CancellationToken,
        seed: RunId,
    ) -> Result<Vec<KeyGenerationReport>> {
        let start_block = self.start_block();
        info!(seed = %seed, "Starting devnet key generation at block {}", start_block);

        let mut tasks = JoinSet::new();
        for (position, operator) in self.online().enumerate() {
            let executor = Arc::new(SimulatedKeyGenerator::new(
                self.blocks.clone(),
                self.config.timing.round_blocks,
                self.faulty.clone(),
            ));
            let controller = DkgGroupController::new(self.context(operator), executor)
                .with_messaging(self.config.timing.messaging());
            let ctx = ctx.clone();
            let seed = seed.clone();
            let name = operator.name.clone();
            tasks.spawn(async move {
                (position, name, controller.generate(&ctx, seed, start_block).await)
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (position, operator, outcomes) =
                joined.map_err(tessera_protocol::ProtocolError::from)?;
            let seats = outcomes?
                .into_iter()
                .map(|(member, outcome)| match outcome {
                    KeyGenerationOutcome::Generated(result) => SeatKeyGeneration::Generated {
                        member,
                        attempt: result.attempt_number,
                        public_key: result.result.public_key,
                        participants: result.result.participants,
                    },
                    KeyGenerationOutcome::Stopped => SeatKeyGeneration::Stopped { member },
                    KeyGenerationOutcome::Failed(error) => {
                        SeatKeyGeneration::Failed { member, error }
                    }
                })
                .collect();
            reports.push((position, KeyGenerationReport { operator, seats }));
        }
        reports.sort_by_key(|(position, _)| *position);
        Ok(reports.into_iter().map(|(_, report)| report).collect())
    }

    /// Sign `messages` under `group_key` on every online operator
    pub async fn run_signing(
        &self,
        ctx: &CancellationToken,
        group_key: &[u8],
        messages: &[RunId],
    ) -> Result<Vec<SigningReport>> {
        let start_block = self.start_block();
        info!(
            messages = messages.len(),
            "Starting devnet signing at block {}", start_block
        );

        let mut tasks = JoinSet::new();
        for (position, operator) in self.online().enumerate() {
            let executor = Arc::new(SimulatedSigner::new(
                self.blocks.clone(),
                self.config.timing.round_blocks,
                self.faulty.clone(),
                group_key.to_vec(),
            ));
            let controller = SigningGroupController::new(self.context(operator), executor)
                .with_messaging(self.config.timing.messaging())
                .with_attempts_limit(self.config.signing_attempts_limit);
            let ctx = ctx.clone();
            let messages = messages.to_vec();
            let name = operator.name.clone();
            tasks.spawn(async move {
                (position, name, controller.sign_batch(&ctx, &messages, start_block).await)
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (position, operator, signed) =
                joined.map_err(tessera_protocol::ProtocolError::from)?;
            let report = match signed {
                Ok(signed) => SigningReport {
                    operator,
                    signatures: signed
                        .into_iter()
                        .map(|signed| SignatureReport {
                            message: signed.message.to_hex(),
                            signature: signed.signature.to_hex(),
                            attempt: signed.attempt_number,
                            start_block: signed.start_block,
                            end_block: signed.end_block,
                            active_members: signed.active_members_count,
                        })
                        .collect(),
                    error: None,
                },
                Err(e) => {
                    warn!(operator = %operator, "Signing batch failed: {}", e);
                    SigningReport {
                        operator,
                        signatures: Vec::new(),
                        error: Some(e.to_string()),
                    }
                }
            };
            reports.push((position, report));
        }
        reports.sort_by_key(|(position, _)| *position);
        Ok(reports.into_iter().map(|(_, report)| report).collect())
    }

    /// Key generation followed by a signing batch under the new key
    pub async fn run(&self, ctx: &CancellationToken) -> Result<DevnetReport> {
        let chain = ctx.child_token();
        self.start_chain(&chain);

        let outcome = self.run_scenario(ctx).await;
        chain.cancel();
        outcome
    }

    async fn run_scenario(&self, ctx: &CancellationToken) -> Result<DevnetReport> {
        let key_generation = self
            .run_key_generation(ctx, self.config.dkg_seed()?)
            .await?;
        let group_public_key = agreed_public_key(&key_generation)?;
        info!("Group public key {}", group_public_key);

        let group_key =
            hex::decode(&group_public_key).map_err(|e| NodeError::Serialization(e.to_string()))?;
        let signing = self
            .run_signing(ctx, &group_key, &self.config.messages()?)
            .await?;

        Ok(DevnetReport {
            group_public_key,
            key_generation,
            signing,
        })
    }
}

/// Public key every generating seat agrees on
pub fn agreed_public_key(reports: &[KeyGenerationReport]) -> Result<String> {
    let keys: BTreeSet<&str> = reports
        .iter()
        .flat_map(|report| &report.seats)
        .filter_map(|seat| match seat {
            SeatKeyGeneration::Generated { public_key, .. } => Some(public_key.as_str()),
            _ => None,
        })
        .collect();

    let mut keys = keys.into_iter();
    match (keys.next(), keys.next()) {
        (Some(key), None) => Ok(key.to_string()),
        (None, _) => Err(NodeError::Config(
            "key generation produced no group key".to_string(),
        )),
        (Some(first), Some(second)) => Err(NodeError::Config(format!(
            "operators generated different group keys: {first} and {second}"
        ))),
    }
}
