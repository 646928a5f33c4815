//! Events published by the processor

#![allow(missing_docs)]

use crate::context::ProcessorState;
use crate::progress::BatchReport;
use crate::types::BlockHeight;
use std::time::Duration;

/// Processor event. Delivered over a broadcast channel; slow subscribers
/// lag instead of stalling the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorEvent {
    /// State transition
    StateChanged {
        from: ProcessorState,
        to: ProcessorState,
    },
    /// A batch finished download, validation and scanning
    Progress(BatchReport),
    /// Validation failed and the chain will be rewound
    ReorgDetected {
        invalid_height: BlockHeight,
        rewind_height: BlockHeight,
        consecutive_reorgs: u32,
    },
    /// A failed action is about to be retried
    Retrying {
        state: ProcessorState,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        error: String,
    },
    /// The run ended with an error
    Failed {
        state: ProcessorState,
        attempts: u32,
        error: String,
    },
    /// Enhancement fetched `count` transactions
    TransactionsEnhanced { count: usize },
    /// UTXO refresh for `addresses` returned `count` outputs
    UtxosFetched { addresses: usize, count: usize },
    /// The run completed; wallet scanned up to `scanned_height`
    Finished { scanned_height: Option<BlockHeight> },
    /// The run stopped
    Stopped,
}

impl ProcessorEvent {
    /// Short name used as the `event` log field
    pub fn name(&self) -> &'static str {
        match self {
            ProcessorEvent::StateChanged { .. } => "state_changed",
            ProcessorEvent::Progress(_) => "batch_scanned",
            ProcessorEvent::ReorgDetected { .. } => "reorg_detected",
            ProcessorEvent::Retrying { .. } => "retrying",
            ProcessorEvent::Failed { .. } => "sync_failed",
            ProcessorEvent::TransactionsEnhanced { .. } => "transactions_enhanced",
            ProcessorEvent::UtxosFetched { .. } => "utxos_fetched",
            ProcessorEvent::Finished { .. } => "sync_finished",
            ProcessorEvent::Stopped => "sync_stopped",
        }
    }

    /// Whether no further events follow for this run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessorEvent::Finished { .. } | ProcessorEvent::Stopped
        )
    }
}
