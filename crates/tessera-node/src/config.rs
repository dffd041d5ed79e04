//! Node configuration

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_core::{AttemptSchedule, GroupParameters, MemberIndex, RunId, DEFAULT_SIGNING_ATTEMPTS_LIMIT};
use tessera_protocol::{MessagingConfig, Retransmission};

use crate::error::{NodeError, Result};

/// Environment variable pointing at the config file
pub const CONFIG_ENV: &str = "TESSERA_CONFIG";

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Group size and thresholds
    pub group: GroupConfig,

    /// Operators in seat order; seats are handed out consecutively
    pub operators: Vec<OperatorConfig>,

    /// Block production and message timing
    pub timing: TimingConfig,

    /// Signing attempts before a signing is abandoned
    pub signing_attempts_limit: u32,

    /// What the devnet runs
    pub scenario: ScenarioConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub group_size: usize,
    pub group_quorum: usize,
    pub honest_threshold: usize,
}

/// One operator of the local devnet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Name, also used as the operator's public key
    pub name: String,

    /// Number of seats held
    pub seats: u8,

    /// Never announces or takes part in any attempt
    #[serde(default)]
    pub offline: bool,

    /// Breaks every round it takes part in
    #[serde(default)]
    pub faulty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    pub block_time_ms: u64,
    /// Blocks a simulated round takes
    pub round_blocks: u64,
    pub announcement_retransmission_ms: u64,
    pub done_poll_interval_ms: u64,
    pub done_retransmission_initial_ms: u64,
    pub done_retransmission_max_ms: u64,
    pub stop_signal_delay_ms: u64,
    pub stop_signal_retransmission_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Key generation seed (hex)
    pub dkg_seed: String,

    /// Messages to sign after key generation (hex)
    pub messages: Vec<String>,

    /// Blocks between "now" and the first attempt
    pub start_delay_blocks: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let operator = |name: &str, seats: u8| OperatorConfig {
            name: name.to_string(),
            seats,
            offline: false,
            faulty: false,
        };
        Self {
            group: GroupConfig {
                group_size: 10,
                group_quorum: 8,
                honest_threshold: 6,
            },
            operators: vec![
                operator("alpha", 3),
                operator("bravo", 2),
                operator("charlie", 1),
                operator("delta", 1),
                operator("echo", 1),
                operator("foxtrot", 1),
                operator("golf", 1),
            ],
            timing: TimingConfig::default(),
            signing_attempts_limit: DEFAULT_SIGNING_ATTEMPTS_LIMIT,
            scenario: ScenarioConfig {
                dkg_seed: "2a9c1e".to_string(),
                messages: vec!["deadbeef".to_string(), "cafebabe".to_string()],
                start_delay_blocks: 2,
            },
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            block_time_ms: 50,
            round_blocks: 3,
            announcement_retransmission_ms: 50,
            done_poll_interval_ms: 50,
            done_retransmission_initial_ms: 50,
            done_retransmission_max_ms: 800,
            stop_signal_delay_ms: 2_000,
            stop_signal_retransmission_ms: 200,
        }
    }
}

impl TimingConfig {
    pub fn block_time(&self) -> Duration {
        Duration::from_millis(self.block_time_ms)
    }

    /// Message timing handed to the group controllers
    pub fn messaging(&self) -> MessagingConfig {
        MessagingConfig {
            announcement_retransmission: Retransmission::Fixed(Duration::from_millis(
                self.announcement_retransmission_ms,
            )),
            done_retransmission: Retransmission::Backoff {
                initial: Duration::from_millis(self.done_retransmission_initial_ms),
                max: Duration::from_millis(self.done_retransmission_max_ms),
            },
            done_poll_interval: Duration::from_millis(self.done_poll_interval_ms),
            stop_signal_delay: Duration::from_millis(self.stop_signal_delay_ms),
            stop_signal_retransmission_interval: Duration::from_millis(
                self.stop_signal_retransmission_ms,
            ),
        }
    }
}

impl NodeConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Path from `TESSERA_CONFIG`, falling back to `tessera.json` in the
    /// working directory
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("tessera.json"))
    }

    pub fn group_parameters(&self) -> GroupParameters {
        GroupParameters::new(
            self.group.group_size,
            self.group.group_quorum,
            self.group.honest_threshold,
        )
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.group_parameters().validate()?;

        let seats: usize = self.operators.iter().map(|o| usize::from(o.seats)).sum();
        if seats != self.group.group_size {
            return Err(NodeError::Config(format!(
                "operators hold {} seats, group size is {}",
                seats, self.group.group_size
            )));
        }

        let mut names = BTreeSet::new();
        for operator in &self.operators {
            if operator.name.is_empty() {
                return Err(NodeError::Config("operator name must not be empty".to_string()));
            }
            if operator.seats == 0 {
                return Err(NodeError::Config(format!(
                    "operator {} holds no seat",
                    operator.name
                )));
            }
            if !names.insert(operator.name.as_str()) {
                return Err(NodeError::Config(format!(
                    "duplicate operator {}",
                    operator.name
                )));
            }
        }

        if self.timing.block_time_ms == 0 {
            return Err(NodeError::Config("block time must be positive".to_string()));
        }
        if self.timing.round_blocks >= AttemptSchedule::SIGNING.max_protocol_blocks {
            return Err(NodeError::Config(format!(
                "simulated rounds of {} blocks never fit a signing attempt",
                self.timing.round_blocks
            )));
        }
        if self.signing_attempts_limit == 0 {
            return Err(NodeError::Config(
                "signing attempts limit must be positive".to_string(),
            ));
        }

        self.dkg_seed()?;
        self.messages()?;
        Ok(())
    }

    pub fn dkg_seed(&self) -> Result<RunId> {
        Ok(RunId::from_hex(&self.scenario.dkg_seed)?)
    }

    pub fn messages(&self) -> Result<Vec<RunId>> {
        self.scenario
            .messages
            .iter()
            .map(|message| Ok(RunId::from_hex(message)?))
            .collect()
    }

    /// Seats of every operator, in roster order
    pub fn seat_assignments(&self) -> Vec<(&OperatorConfig, Vec<MemberIndex>)> {
        let mut next = 1u8;
        self.operators
            .iter()
            .map(|operator| {
                let seats = (next..next.saturating_add(operator.seats))
                    .map(MemberIndex)
                    .collect();
                next = next.saturating_add(operator.seats);
                (operator, seats)
            })
            .collect()
    }

    /// Seats of faulty operators
    pub fn faulty_members(&self) -> BTreeSet<MemberIndex> {
        self.seat_assignments()
            .into_iter()
            .filter(|(operator, _)| operator.faulty)
            .flat_map(|(_, seats)| seats)
            .collect()
    }
}
