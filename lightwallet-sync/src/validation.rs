//! Reorg rewind policy and the retry budget

use crate::config::ProcessorConfig;
use crate::context::ProcessorState;
use crate::types::BlockHeight;
use crate::{Error, Result};
use lightwallet_params::CheckpointList;

/// Height to rewind to after validation failed at `invalid_height`.
///
/// The margin grows with each consecutive reorg and is capped by
/// `max_reorg_size`. A checkpoint below the failure or the birthday floor
/// may raise the target, and the engine's nearest rewindable height may
/// lower it. The result is always strictly below `invalid_height`.
pub fn compute_rewind_target(
    invalid_height: BlockHeight,
    consecutive_reorgs: u32,
    config: &ProcessorConfig,
    checkpoints: &CheckpointList,
    birthday: BlockHeight,
) -> BlockHeight {
    let offset = config
        .max_reorg_size
        .min(config.rewind_distance.saturating_mul(consecutive_reorgs as u64 + 1));
    let by_margin = invalid_height.saturating_sub(offset).saturating_sub(1);

    let checkpoint = invalid_height
        .checked_sub(1)
        .and_then(|below| checkpoints.checkpoint_at_height(below).ok())
        .map(|cp| cp.height)
        .unwrap_or(0);

    let floor = birthday.saturating_sub(config.max_reorg_size);

    by_margin
        .max(checkpoint)
        .max(floor)
        .min(invalid_height.saturating_sub(1))
}

/// Attempts consumed by the current run.
///
/// Reset after every fully scanned batch; exhaustion ends the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    attempts: u32,
    max_attempts: u32,
}

impl RetryBudget {
    /// Budget allowing `max_attempts` (at least one)
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Attempts consumed
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Configured maximum
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether no attempts remain
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Spend one attempt on a failure of `state`. Returns the attempt
    /// number, or `MaxAttemptsReached` once the budget is used up.
    pub fn consume(&mut self, state: ProcessorState, last_error: &Error) -> Result<u32> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.max_attempts {
            return Err(Error::MaxAttemptsReached {
                attempts: self.attempts,
                state,
                last_error: last_error.to_string(),
            });
        }
        Ok(self.attempts)
    }

    /// Start over after a fully processed batch
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
