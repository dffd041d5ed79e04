//! Group parameters and seat bookkeeping

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{MemberIndex, OperatorAddress};

/// Size and thresholds of a threshold group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupParameters {
    /// Number of seats in the group
    pub group_size: usize,
    /// Minimum number of ready seats needed for a key generation attempt
    pub group_quorum: usize,
    /// Minimum number of seats that must take part in signing
    pub honest_threshold: usize,
}

impl GroupParameters {
    pub fn new(group_size: usize, group_quorum: usize, honest_threshold: usize) -> Self {
        Self {
            group_size,
            group_quorum,
            honest_threshold,
        }
    }

    /// Validate the parameters
    pub fn validate(&self) -> Result<()> {
        if self.group_size == 0 || self.group_size > u8::MAX as usize {
            return Err(Error::InvalidParameters(format!(
                "group size must be in 1..=255, got {}",
                self.group_size
            )));
        }
        if self.honest_threshold == 0 || self.honest_threshold > self.group_quorum {
            return Err(Error::InvalidParameters(format!(
                "honest threshold {} must be in 1..=group quorum ({})",
                self.honest_threshold, self.group_quorum
            )));
        }
        if self.group_quorum > self.group_size {
            return Err(Error::InvalidParameters(format!(
                "group quorum {} exceeds group size {}",
                self.group_quorum, self.group_size
            )));
        }
        Ok(())
    }

    /// Number of seats that may misbehave without breaking the protocol
    pub fn dishonest_threshold(&self) -> usize {
        self.group_size - self.honest_threshold
    }
}

/// Seats that did not show up in `ready`, ascending
pub fn unready_members(ready: &[MemberIndex], group_size: usize) -> Vec<MemberIndex> {
    let ready: BTreeSet<_> = ready.iter().copied().collect();
    MemberIndex::all(group_size)
        .filter(|index| !ready.contains(index))
        .collect()
}

/// Operator to seat count view of a seat list
pub fn seat_counts<'a>(
    operators: impl IntoIterator<Item = &'a OperatorAddress>,
) -> BTreeMap<&'a OperatorAddress, usize> {
    let mut counts = BTreeMap::new();
    for operator in operators {
        *counts.entry(operator).or_insert(0) += 1;
    }
    counts
}
