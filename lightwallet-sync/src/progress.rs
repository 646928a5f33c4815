//! Progress reporting types

use crate::types::{BlockHeight, BlockRange};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Download position relative to the sync target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// Upper bound of the sync range
    pub target_height: BlockHeight,
    /// Highest contiguous height in the block store
    pub downloaded_height: BlockHeight,
}

impl DownloadProgress {
    /// Progress of `range` given the store's highest height
    pub fn for_range(range: BlockRange, highest_stored: BlockHeight) -> Self {
        Self {
            target_height: range.upper(),
            downloaded_height: highest_stored.min(range.upper()),
        }
    }

    /// Fraction downloaded, 0.0 to 1.0, measured from `start`
    pub fn fraction_from(&self, start: BlockHeight) -> f64 {
        if self.target_height < start {
            return 1.0;
        }
        let total = (self.target_height - start + 1) as f64;
        let done = self.downloaded_height.saturating_sub(start.saturating_sub(1)) as f64;
        (done / total).clamp(0.0, 1.0)
    }

    /// Whether the store has reached the target
    pub fn is_complete(&self) -> bool {
        self.downloaded_height >= self.target_height
    }
}

/// One completed download/validate/scan cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// First height of the batch
    pub start_height: BlockHeight,
    /// Last height of the batch
    pub end_height: BlockHeight,
    /// Wall time from download wait to scan completion
    #[serde(with = "crate::config::duration_ms")]
    pub duration: Duration,
}

impl BatchReport {
    /// Blocks covered by the report
    pub fn block_count(&self) -> u64 {
        self.end_height.saturating_sub(self.start_height) + 1
    }

    /// Blocks per second, `None` for a zero duration
    pub fn blocks_per_second(&self) -> Option<f64> {
        let secs = self.duration.as_secs_f64();
        (secs > 0.0).then(|| self.block_count() as f64 / secs)
    }
}

/// Caller-side accumulator over batch reports.
///
/// The processor keeps no history; subscribers feed this from the event
/// stream if they want run-level numbers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessorMetrics {
    batches: u64,
    blocks: u64,
    min_height: Option<BlockHeight>,
    max_height: Option<BlockHeight>,
    min_duration: Option<Duration>,
    max_duration: Option<Duration>,
    total_duration: Duration,
}

impl ProcessorMetrics {
    /// Empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one batch
    pub fn record(&mut self, report: &BatchReport) {
        self.batches += 1;
        self.blocks += report.block_count();
        self.min_height = Some(
            self.min_height
                .map_or(report.start_height, |h| h.min(report.start_height)),
        );
        self.max_height = Some(
            self.max_height
                .map_or(report.end_height, |h| h.max(report.end_height)),
        );
        self.min_duration = Some(
            self.min_duration
                .map_or(report.duration, |d| d.min(report.duration)),
        );
        self.max_duration = Some(
            self.max_duration
                .map_or(report.duration, |d| d.max(report.duration)),
        );
        self.total_duration += report.duration;
    }

    /// Batches recorded
    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Blocks recorded across all batches
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Lowest start height seen
    pub fn min_height(&self) -> Option<BlockHeight> {
        self.min_height
    }

    /// Highest end height seen
    pub fn max_height(&self) -> Option<BlockHeight> {
        self.max_height
    }

    /// Fastest batch
    pub fn min_duration(&self) -> Option<Duration> {
        self.min_duration
    }

    /// Slowest batch
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration
    }

    /// Mean batch duration
    pub fn average_duration(&self) -> Option<Duration> {
        if self.batches == 0 {
            return None;
        }
        Some(self.total_duration / self.batches as u32)
    }

    /// Total time spent in batches
    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }
}
