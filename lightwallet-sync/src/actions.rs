//! Actions driven by the processor's state machine.
//!
//! Each non-terminal [`ProcessorState`] maps to one action. An action does
//! its work and returns the next state; it never retries on its own. Retry
//! and stop decisions are made by the run loop in `processor`.

use crate::backend::{ChainBackend, ChainValidity};
use crate::cancel::CancelToken;
use crate::config::ProcessorConfig;
use crate::context::{ActionContext, ProcessorState};
use crate::downloader::BlockDownloader;
use crate::events::ProcessorEvent;
use crate::progress::BatchReport;
use crate::service::BlockService;
use crate::types::{BlockHeight, BlockRange, RawTransaction};
use crate::validation::{compute_rewind_target, RetryBudget};
use crate::{Error, Result};
use lightwallet_params::CheckpointList;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Collaborators shared by every action of a run
pub(crate) struct SyncEnv {
    pub service: Arc<dyn BlockService>,
    pub backend: Arc<dyn ChainBackend>,
    pub downloader: Arc<BlockDownloader>,
    pub config: ProcessorConfig,
    pub checkpoints: CheckpointList,
    pub birthday: BlockHeight,
    pub events: broadcast::Sender<ProcessorEvent>,
    pub cancel: CancelToken,
}

/// One sync attempt: the context, the retry budget and batch timing
pub(crate) struct SyncRun {
    pub env: SyncEnv,
    pub context: ActionContext,
    pub budget: RetryBudget,
    batch_started: Option<Instant>,
    reorgs_before_failure: u32,
}

impl SyncRun {
    pub fn new(env: SyncEnv, context: ActionContext) -> Self {
        let budget = RetryBudget::new(env.config.retry.max_attempts);
        Self {
            env,
            context,
            budget,
            batch_started: None,
            reorgs_before_failure: 0,
        }
    }

    pub fn emit(&self, event: ProcessorEvent) {
        // no subscribers is fine
        let _ = self.env.events.send(event);
    }

    /// Apply `next` and publish the transition
    pub fn transition(&self, next: ProcessorState) {
        let current = self.context.state();
        if current == next {
            return;
        }
        let from = self.context.update(next);
        debug!("State {} -> {}", from, next);
        self.emit(ProcessorEvent::StateChanged { from, to: next });
    }

    /// Run the action for the current state
    pub async fn step(&mut self) -> Result<ProcessorState> {
        match self.context.state() {
            ProcessorState::Idle => self.compute_sync_range().await,
            ProcessorState::Downloading => self.download().await,
            ProcessorState::Validating => self.validate().await,
            ProcessorState::Scanning => self.scan().await,
            ProcessorState::HandlingError => self.handle_error().await,
            ProcessorState::ClearingCache => self.clear_cache().await,
            ProcessorState::Enhancing => self.enhance().await,
            ProcessorState::FetchingUtxos => self.fetch_utxos().await,
            terminal @ (ProcessorState::Stopped | ProcessorState::Finished) => Ok(terminal),
        }
    }

    fn batch_size(&self) -> u64 {
        self.env.config.batch_size
    }

    fn max_buffer_size(&self) -> usize {
        self.env.config.max_buffer_size
    }

    /// Download limit for a batch: one buffer of lookahead past its end
    fn lookahead_limit(&self, batch: BlockRange, range: BlockRange) -> BlockHeight {
        batch
            .upper()
            .saturating_add(self.max_buffer_size() as u64)
            .min(range.upper())
    }

    /// Point the downloader at `range` and start it
    fn begin_download(&self, range: BlockRange) -> Result<()> {
        let downloader = &self.env.downloader;
        downloader.set_sync_range(range)?;
        if let Some(first) = range.batch_from(range.lower(), self.batch_size()) {
            downloader.set_download_limit(self.lookahead_limit(first, range));
        }
        downloader.start_download(self.max_buffer_size())
    }

    async fn compute_sync_range(&mut self) -> Result<ProcessorState> {
        let latest = self.env.service.latest_block_height().await?;
        let scanned = self.env.backend.latest_scanned_height().await?;
        let lower = scanned
            .map(|h| h + 1)
            .unwrap_or(self.env.birthday)
            .max(self.env.birthday);

        if lower > latest {
            info!("Wallet already scanned to {}, chain tip {}", lower - 1, latest);
            return Ok(ProcessorState::Enhancing);
        }

        self.env.backend.record_target_height(latest).await?;
        let range = BlockRange::new(lower, latest)?;
        info!("Syncing {} ({} blocks)", range, range.len());
        self.context.set_sync_range(range);
        self.begin_download(range)?;
        Ok(ProcessorState::Downloading)
    }

    async fn download(&mut self) -> Result<ProcessorState> {
        let range = self.context.sync_range().ok_or(Error::SyncRangeNotSet)?;
        let batch = match self.context.next_batch(self.batch_size()) {
            Some(batch) => batch,
            None => return Ok(ProcessorState::Enhancing),
        };
        if self.batch_started.is_none() {
            self.batch_started = Some(Instant::now());
        }

        let downloader = &self.env.downloader;
        downloader.set_download_limit(self.lookahead_limit(batch, range));
        if !downloader.is_running() {
            debug!("Restarting block download for {}", range);
            downloader.start_download(self.max_buffer_size())?;
        }
        downloader
            .wait_until_requested_blocks_are_downloaded(batch, &self.env.cancel)
            .await?;
        Ok(ProcessorState::Validating)
    }

    async fn validate(&mut self) -> Result<ProcessorState> {
        let batch = self.context.current_batch().ok_or(Error::SyncRangeNotSet)?;
        let store = self.env.downloader.store();
        match self.env.backend.validate_chain(store, batch).await? {
            ChainValidity::Valid => Ok(ProcessorState::Scanning),
            ChainValidity::InvalidAt(height) => {
                self.reorgs_before_failure = self.context.record_invalid_height(height);
                warn!("Chain validation failed at height {} in {}", height, batch);
                Ok(ProcessorState::HandlingError)
            }
        }
    }

    async fn scan(&mut self) -> Result<ProcessorState> {
        let batch = self.context.current_batch().ok_or(Error::SyncRangeNotSet)?;
        self.env
            .backend
            .scan_blocks(self.env.downloader.store(), batch)
            .await?;
        self.context.mark_scanned(batch);
        self.budget.reset();

        let duration = self
            .batch_started
            .take()
            .map(|started| started.elapsed())
            .unwrap_or_default();
        self.emit(ProcessorEvent::Progress(BatchReport {
            start_height: batch.lower(),
            end_height: batch.upper(),
            duration,
        }));

        if self.context.is_range_complete() {
            Ok(ProcessorState::Enhancing)
        } else {
            Ok(ProcessorState::Downloading)
        }
    }

    async fn handle_error(&mut self) -> Result<ProcessorState> {
        let invalid = self
            .context
            .invalid_height()
            .ok_or_else(|| Error::Rewind("no validation failure recorded".to_string()))?;
        let failure = Error::ChainValidation { height: invalid };
        self.budget.consume(ProcessorState::HandlingError, &failure)?;

        let target = compute_rewind_target(
            invalid,
            self.reorgs_before_failure,
            &self.env.config,
            &self.env.checkpoints,
            self.env.birthday,
        );
        let target = self
            .env
            .backend
            .nearest_rewind_height(target)
            .await?
            .min(target);

        warn!(
            "Reorg at {}: rewinding to {} ({} consecutive)",
            invalid,
            target,
            self.reorgs_before_failure + 1
        );
        self.context.set_rewind_target(Some(target));
        self.emit(ProcessorEvent::ReorgDetected {
            invalid_height: invalid,
            rewind_height: target,
            consecutive_reorgs: self.reorgs_before_failure + 1,
        });
        Ok(ProcessorState::ClearingCache)
    }

    async fn clear_cache(&mut self) -> Result<ProcessorState> {
        let target = self
            .context
            .rewind_target()
            .ok_or_else(|| Error::Rewind("no rewind target".to_string()))?;
        let range = self.context.sync_range().ok_or(Error::SyncRangeNotSet)?;

        self.env.downloader.stop_download().await;
        self.env.backend.rewind_to(target).await?;
        let store = self.env.downloader.store();
        if target < store.highest_height()? {
            store.rewind(target)?;
        }
        self.context.set_rewind_target(None);
        self.batch_started = None;

        let lower = (target + 1).max(self.env.birthday);
        let resumed = BlockRange::new(lower, range.upper())?;
        info!("Resuming sync at {} after rewind to {}", resumed, target);
        self.context.set_sync_range(resumed);
        self.begin_download(resumed)?;
        Ok(ProcessorState::Downloading)
    }

    async fn enhance(&mut self) -> Result<ProcessorState> {
        if !self.env.config.enhance_transactions {
            return Ok(ProcessorState::FetchingUtxos);
        }
        let Some(upper) = self.env.backend.latest_scanned_height().await? else {
            return Ok(ProcessorState::FetchingUtxos);
        };
        let range = BlockRange::new(self.env.birthday.min(upper), upper)?;
        let pending = self.env.backend.transactions_to_enhance(range).await?;

        let mut enhanced = 0;
        for tx in pending {
            if self.env.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let raw = self.env.service.fetch_transaction(&tx.txid).await?;
            let raw = RawTransaction {
                height: raw.height.or(Some(tx.height)),
                data: raw.data,
            };
            self.env.backend.store_transaction(&tx.txid, &raw).await?;
            enhanced += 1;
        }

        if enhanced > 0 {
            self.emit(ProcessorEvent::TransactionsEnhanced { count: enhanced });
        }
        Ok(ProcessorState::FetchingUtxos)
    }

    async fn fetch_utxos(&mut self) -> Result<ProcessorState> {
        if !self.env.config.fetch_utxos {
            return Ok(ProcessorState::Finished);
        }
        let addresses = self.env.backend.transparent_receivers().await?;
        if addresses.is_empty() {
            return Ok(ProcessorState::Finished);
        }
        let utxos = self
            .env
            .service
            .fetch_utxos(&addresses, self.env.birthday)
            .await?;
        self.env.backend.put_utxos(&addresses, &utxos).await?;
        self.emit(ProcessorEvent::UtxosFetched {
            addresses: addresses.len(),
            count: utxos.len(),
        });
        Ok(ProcessorState::Finished)
    }
}
