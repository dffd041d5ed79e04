//! Block-height arithmetic for attempt windows.
//!
//! Attempt boundaries are a pure function of the run's initial block and the
//! attempt number, so every member computes the same windows independently.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fixed block budget of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptSchedule {
    /// Blocks between the attempt start and the announcement start
    pub announcement_delay_blocks: u64,
    /// Blocks the announcement stays open
    pub announcement_active_blocks: u64,
    /// Upper bound on the duration of the protocol round
    pub max_protocol_blocks: u64,
    /// Blocks before the next attempt may start
    pub cooldown_blocks: u64,
}

impl AttemptSchedule {
    /// Distributed key generation
    pub const KEY_GENERATION: AttemptSchedule = AttemptSchedule {
        announcement_delay_blocks: 1,
        announcement_active_blocks: 5,
        max_protocol_blocks: 200,
        cooldown_blocks: 5,
    };

    /// Threshold signing
    pub const SIGNING: AttemptSchedule = AttemptSchedule {
        announcement_delay_blocks: 1,
        announcement_active_blocks: 5,
        max_protocol_blocks: 30,
        cooldown_blocks: 5,
    };

    /// Total blocks reserved for one attempt
    pub fn max_attempt_blocks(&self) -> u64 {
        self.announcement_delay_blocks
            + self.announcement_active_blocks
            + self.max_protocol_blocks
            + self.cooldown_blocks
    }

    /// Window of the given attempt, 1-indexed
    pub fn window(&self, initial_start_block: u64, attempt_number: u32) -> Result<AttemptWindow> {
        if attempt_number == 0 {
            return Err(Error::InvalidAttempt(attempt_number));
        }
        let offset = u64::from(attempt_number - 1)
            .checked_mul(self.max_attempt_blocks())
            .ok_or(Error::InvalidAttempt(attempt_number))?;
        let start_block = initial_start_block
            .checked_add(offset)
            .ok_or(Error::InvalidAttempt(attempt_number))?;
        let announcement_start_block = start_block.saturating_add(self.announcement_delay_blocks);
        let announcement_end_block =
            announcement_start_block.saturating_add(self.announcement_active_blocks);

        Ok(AttemptWindow {
            attempt_number,
            start_block,
            announcement_start_block,
            announcement_end_block,
            timeout_block: announcement_end_block.saturating_add(self.max_protocol_blocks),
        })
    }
}

/// Block heights bounding one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptWindow {
    pub attempt_number: u32,
    pub start_block: u64,
    pub announcement_start_block: u64,
    pub announcement_end_block: u64,
    pub timeout_block: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_attempt_blocks() {
        assert_eq!(AttemptSchedule::KEY_GENERATION.max_attempt_blocks(), 211);
        assert_eq!(AttemptSchedule::SIGNING.max_attempt_blocks(), 41);
    }

    #[test]
    fn test_signing_windows() {
        let first = AttemptSchedule::SIGNING.window(200, 1).unwrap();
        assert_eq!(first.start_block, 200);
        assert_eq!(first.announcement_start_block, 201);
        assert_eq!(first.announcement_end_block, 206);
        assert_eq!(first.timeout_block, 236);

        let second = AttemptSchedule::SIGNING.window(200, 2).unwrap();
        assert_eq!(second.start_block, 241);
        assert_eq!(second.announcement_end_block, 247);
        assert_eq!(second.timeout_block, 277);
    }

    #[test]
    fn test_attempt_zero_rejected() {
        assert_eq!(
            AttemptSchedule::SIGNING.window(0, 0),
            Err(Error::InvalidAttempt(0))
        );
    }

    #[test]
    fn test_overflow_rejected() {
        assert!(AttemptSchedule::KEY_GENERATION.window(u64::MAX, 2).is_err());
    }
}
