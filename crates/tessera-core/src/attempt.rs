//! Protocol run and attempt descriptors

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::group::GroupParameters;
use crate::rng::attempt_seed;
use crate::types::{MemberIndex, OperatorAddress, RunId};

/// Immutable context of one key generation or signing run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolRun {
    /// DKG seed or message being signed
    pub run_id: RunId,
    /// Operator of every seat; seat `i` is at position `i - 1`
    pub operators: Vec<OperatorAddress>,
    pub parameters: GroupParameters,
    /// Block at which the first attempt starts
    pub initial_start_block: u64,
}

impl ProtocolRun {
    pub fn new(
        run_id: RunId,
        operators: Vec<OperatorAddress>,
        parameters: GroupParameters,
        initial_start_block: u64,
    ) -> Result<Self> {
        parameters.validate()?;
        if operators.len() != parameters.group_size {
            return Err(Error::InvalidParameters(format!(
                "{} operators given for a group of {} seats",
                operators.len(),
                parameters.group_size
            )));
        }
        Ok(Self {
            run_id,
            operators,
            parameters,
            initial_start_block,
        })
    }

    /// Selection seed shared by all attempts of the run
    pub fn seed(&self) -> i64 {
        attempt_seed(&self.run_id)
    }

    pub fn session_id(&self, attempt_number: u32) -> String {
        self.run_id.session_id(attempt_number)
    }

    pub fn operator_of(&self, member: MemberIndex) -> Option<&OperatorAddress> {
        if member.0 == 0 {
            return None;
        }
        self.operators.get(member.position())
    }

    /// Seats held by `operator`, ascending
    pub fn seats_of(&self, operator: &OperatorAddress) -> Vec<MemberIndex> {
        self.operators
            .iter()
            .enumerate()
            .filter(|(_, o)| *o == operator)
            .map(|(i, _)| MemberIndex((i + 1) as u8))
            .collect()
    }
}

/// Parameters of one attempt handed to the round executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptParams {
    pub number: u32,
    /// Block at which the round starts (the announcement end block)
    pub start_block: u64,
    /// Block by which the round must be finished
    pub timeout_block: u64,
    pub excluded_members: Vec<MemberIndex>,
}

impl AttemptParams {
    pub fn is_excluded(&self, member: MemberIndex) -> bool {
        self.excluded_members.contains(&member)
    }

    /// Seats taking part in the round, ascending
    pub fn included_members(&self, group_size: usize) -> Vec<MemberIndex> {
        MemberIndex::all(group_size)
            .filter(|member| !self.is_excluded(*member))
            .collect()
    }
}

/// Outcome of a successful retry loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryLoopResult<R> {
    pub result: R,
    /// Attempt that produced the result
    pub attempt_number: u32,
    pub attempt_timeout_block: u64,
    /// Latest block at which a confirmed participant finished the round
    pub latest_end_block: u64,
    /// Seats that announced readiness for the successful attempt
    pub active_members_count: usize,
}
