//! Processor state machine and the per-run action context.

use crate::types::{BlockHeight, BlockRange};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessorState {
    /// Not started, or between runs
    Idle,
    /// Waiting for the current batch to reach the block store
    Downloading,
    /// Checking the batch links onto the wallet's chain
    Validating,
    /// Trial-decrypting the batch into wallet state
    Scanning,
    /// Rewinding block store and wallet after a reorg
    ClearingCache,
    /// Fetching full transactions for scanned wallet transactions
    Enhancing,
    /// Refreshing transparent UTXOs
    FetchingUtxos,
    /// Computing the rewind target after a validation failure
    HandlingError,
    /// Cancelled or failed; terminal for the run
    Stopped,
    /// Caught up with the sync range; terminal for the run
    Finished,
}

impl ProcessorState {
    /// Stable name for logs and events
    pub fn name(&self) -> &'static str {
        match self {
            ProcessorState::Idle => "idle",
            ProcessorState::Downloading => "downloading",
            ProcessorState::Validating => "validating",
            ProcessorState::Scanning => "scanning",
            ProcessorState::ClearingCache => "clearingCache",
            ProcessorState::Enhancing => "enhancing",
            ProcessorState::FetchingUtxos => "fetchingUTXOs",
            ProcessorState::HandlingError => "handlingError",
            ProcessorState::Stopped => "stopped",
            ProcessorState::Finished => "finished",
        }
    }

    /// Whether a run ends in this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessorState::Stopped | ProcessorState::Finished)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: ProcessorState) -> bool {
        use ProcessorState::*;
        if next == Stopped {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Downloading)
                | (Idle, Enhancing)
                | (Downloading, Validating)
                | (Validating, Scanning)
                | (Validating, HandlingError)
                | (Scanning, Downloading)
                | (Scanning, Enhancing)
                | (HandlingError, ClearingCache)
                | (ClearingCache, Downloading)
                | (Enhancing, FetchingUtxos)
                | (FetchingUtxos, Finished)
        )
    }
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
struct ContextInner {
    state: ProcessorState,
    prev_state: Option<ProcessorState>,
    sync_range: Option<BlockRange>,
    processed_height: Option<BlockHeight>,
    current_batch: Option<BlockRange>,
    invalid_height: Option<BlockHeight>,
    rewind_target: Option<BlockHeight>,
    consecutive_reorgs: u32,
}

/// Snapshot of the context for observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSnapshot {
    /// Current state
    pub state: ProcessorState,
    /// State before the last transition
    pub prev_state: Option<ProcessorState>,
    /// Range targeted by this run
    pub sync_range: Option<BlockRange>,
    /// Highest height scanned during this run
    pub processed_height: Option<BlockHeight>,
}

/// State of one sync attempt. Cheap to clone; clones share state.
///
/// Readers take a short read lock and copy out, so observers never see a
/// half-applied transition and never block the pipeline for long.
#[derive(Debug, Clone)]
pub struct ActionContext {
    inner: Arc<RwLock<ContextInner>>,
}

impl ActionContext {
    /// Fresh context in `Idle`
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ContextInner {
                state: ProcessorState::Idle,
                prev_state: None,
                sync_range: None,
                processed_height: None,
                current_batch: None,
                invalid_height: None,
                rewind_target: None,
                consecutive_reorgs: 0,
            })),
        }
    }

    /// Move to `new_state`, recording the outgoing one as `prev_state`.
    /// Returns the outgoing state.
    pub fn update(&self, new_state: ProcessorState) -> ProcessorState {
        let mut inner = self.inner.write();
        let old = inner.state;
        if !old.can_transition_to(new_state) {
            tracing::warn!("Unexpected state transition {} -> {}", old, new_state);
        }
        inner.prev_state = Some(old);
        inner.state = new_state;
        old
    }

    /// Current state
    pub fn state(&self) -> ProcessorState {
        self.inner.read().state
    }

    /// State before the last transition
    pub fn prev_state(&self) -> Option<ProcessorState> {
        self.inner.read().prev_state
    }

    /// Consistent copy of the observable fields
    pub fn snapshot(&self) -> ContextSnapshot {
        let inner = self.inner.read();
        ContextSnapshot {
            state: inner.state,
            prev_state: inner.prev_state,
            sync_range: inner.sync_range,
            processed_height: inner.processed_height,
        }
    }

    /// Range targeted by this run
    pub fn sync_range(&self) -> Option<BlockRange> {
        self.inner.read().sync_range
    }

    /// Replace the sync range; scanning resumes at its lower bound
    pub fn set_sync_range(&self, range: BlockRange) {
        let mut inner = self.inner.write();
        inner.sync_range = Some(range);
        inner.processed_height = range.lower().checked_sub(1);
        inner.current_batch = None;
    }

    /// Clear the range (stop)
    pub fn clear_sync_range(&self) {
        let mut inner = self.inner.write();
        inner.sync_range = None;
        inner.current_batch = None;
    }

    /// Highest height scanned during this run
    pub fn processed_height(&self) -> Option<BlockHeight> {
        self.inner.read().processed_height
    }

    /// Next batch of at most `batch_size` heights after the processed height
    pub fn next_batch(&self, batch_size: u64) -> Option<BlockRange> {
        let mut inner = self.inner.write();
        let range = inner.sync_range?;
        let start = inner
            .processed_height
            .map(|h| h + 1)
            .unwrap_or_else(|| range.lower());
        let batch = range.batch_from(start, batch_size);
        inner.current_batch = batch;
        batch
    }

    /// Batch currently moving through download/validate/scan
    pub fn current_batch(&self) -> Option<BlockRange> {
        self.inner.read().current_batch
    }

    /// Record that `batch` has been scanned
    pub fn mark_scanned(&self, batch: BlockRange) {
        let mut inner = self.inner.write();
        inner.processed_height = Some(batch.upper());
        inner.current_batch = None;
        inner.consecutive_reorgs = 0;
        inner.invalid_height = None;
    }

    /// Whether the whole sync range has been scanned
    pub fn is_range_complete(&self) -> bool {
        let inner = self.inner.read();
        match (inner.sync_range, inner.processed_height) {
            (Some(range), Some(done)) => done >= range.upper(),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    /// Record a validation failure at `height`; returns consecutive reorgs so far
    pub fn record_invalid_height(&self, height: BlockHeight) -> u32 {
        let mut inner = self.inner.write();
        inner.invalid_height = Some(height);
        let prior = inner.consecutive_reorgs;
        inner.consecutive_reorgs += 1;
        prior
    }

    /// Height of the last validation failure
    pub fn invalid_height(&self) -> Option<BlockHeight> {
        self.inner.read().invalid_height
    }

    /// Rewind target chosen while handling the last failure
    pub fn rewind_target(&self) -> Option<BlockHeight> {
        self.inner.read().rewind_target
    }

    /// Set (or clear) the rewind target
    pub fn set_rewind_target(&self, target: Option<BlockHeight>) {
        self.inner.write().rewind_target = target;
    }
}

impl Default for ActionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_previous_state_is_recorded() {
        let context = ActionContext::new();
        assert_eq!(context.state(), ProcessorState::Idle);
        assert_eq!(context.prev_state(), None);

        context.update(ProcessorState::ClearingCache);
        assert_eq!(context.state(), ProcessorState::ClearingCache);
        assert_eq!(context.prev_state(), Some(ProcessorState::Idle));

        context.update(ProcessorState::Downloading);
        assert_eq!(context.prev_state(), Some(ProcessorState::ClearingCache));
    }

    #[test]
    fn test_transition_table() {
        use ProcessorState::*;
        let happy = [
            Idle,
            Downloading,
            Validating,
            Scanning,
            Enhancing,
            FetchingUtxos,
            Finished,
        ];
        for pair in happy.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(Validating.can_transition_to(HandlingError));
        assert!(HandlingError.can_transition_to(ClearingCache));
        assert!(ClearingCache.can_transition_to(Downloading));
        for state in happy {
            assert!(state.can_transition_to(Stopped));
        }
        assert!(!Idle.can_transition_to(Scanning));
        assert!(!Finished.can_transition_to(Downloading));
        assert!(!Scanning.can_transition_to(Validating));
    }

    #[test]
    fn test_batches_walk_the_range() {
        let context = ActionContext::new();
        assert_eq!(context.next_batch(4), None);

        context.set_sync_range(BlockRange::new(1000, 1010).unwrap());
        let first = context.next_batch(4).unwrap();
        assert_eq!((first.lower(), first.upper()), (1000, 1003));
        assert_eq!(context.current_batch(), Some(first));

        context.mark_scanned(first);
        assert!(!context.is_range_complete());
        let second = context.next_batch(4).unwrap();
        assert_eq!(second.lower(), 1004);

        context.mark_scanned(BlockRange::new(1004, 1010).unwrap());
        assert!(context.is_range_complete());
        assert_eq!(context.next_batch(4), None);
    }

    #[test]
    fn test_reorg_counter_resets_after_scan() {
        let context = ActionContext::new();
        context.set_sync_range(BlockRange::new(1, 100).unwrap());
        assert_eq!(context.record_invalid_height(50), 0);
        assert_eq!(context.record_invalid_height(45), 1);
        assert_eq!(context.invalid_height(), Some(45));

        context.mark_scanned(BlockRange::new(1, 10).unwrap());
        assert_eq!(context.invalid_height(), None);
        assert_eq!(context.record_invalid_height(20), 0);
    }

    #[test]
    fn test_concurrent_readers_see_whole_transitions() {
        let context = ActionContext::new();
        let reader = {
            let context = context.clone();
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    let snap = context.snapshot();
                    if let Some(prev) = snap.prev_state {
                        assert_ne!(prev, snap.state);
                    }
                }
            })
        };
        for _ in 0..1_000 {
            context.update(ProcessorState::Downloading);
            context.update(ProcessorState::Validating);
            context.update(ProcessorState::Scanning);
        }
        reader.join().unwrap();
    }
}
