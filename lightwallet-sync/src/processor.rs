//! Compact block processor: owns the state machine, applies the retry
//! policy and publishes events.

use crate::actions::{SyncEnv, SyncRun};
use crate::backend::ChainBackend;
use crate::block_store::BlockStore;
use crate::cancel::CancelToken;
use crate::config::ProcessorConfig;
use crate::context::{ActionContext, ContextSnapshot, ProcessorState};
use crate::downloader::BlockDownloader;
use crate::error::ErrorKind;
use crate::events::ProcessorEvent;
use crate::progress::DownloadProgress;
use crate::service::BlockService;
use crate::types::{BlockHeight, ViewingKey};
use crate::{Error, Result};
use lightwallet_params::{CheckpointList, Network};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How far [`CompactBlockProcessor::rewind`] goes back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewindPolicy {
    /// Rescan everything from the wallet birthday
    Birthday,
    /// Keep state up to and including `height`
    Height(BlockHeight),
    /// Rescan the block a transaction was mined in
    Transaction {
        /// Height the transaction was mined at
        mined_height: BlockHeight,
    },
    /// Step back by the configured rewind distance from the scanned tip
    Quick,
}

/// Clears the running flag when the run task ends, including by panic
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Completion signal of one run, shared by every caller of `wait` and `stop`
#[derive(Clone)]
struct RunHandle {
    done: watch::Receiver<bool>,
    outcome: Arc<Mutex<Option<Result<ProcessorState>>>>,
}

impl RunHandle {
    /// Resolves once the run task has exited. `false` if it died without
    /// recording an outcome.
    async fn finished(&self) -> bool {
        let mut done = self.done.clone();
        let finished = done.wait_for(|done| *done).await.is_ok();
        finished
    }
}

struct ProcessorInner {
    service: Arc<dyn BlockService>,
    backend: Arc<dyn ChainBackend>,
    downloader: Arc<BlockDownloader>,
    config: ProcessorConfig,
    checkpoints: CheckpointList,
    events: broadcast::Sender<ProcessorEvent>,
    birthday: RwLock<Option<BlockHeight>>,
    context: RwLock<ActionContext>,
    running: Arc<AtomicBool>,
    cancel: Mutex<CancelToken>,
    run: Mutex<Option<RunHandle>>,
}

/// Drives download, validation, scanning and reorg recovery.
///
/// Cheap to clone; clones control the same processor.
#[derive(Clone)]
pub struct CompactBlockProcessor {
    inner: Arc<ProcessorInner>,
}

impl CompactBlockProcessor {
    /// Processor using the bundled checkpoints for the configured network
    pub fn new(
        service: Arc<dyn BlockService>,
        backend: Arc<dyn ChainBackend>,
        store: BlockStore,
        config: ProcessorConfig,
    ) -> Result<Self> {
        let checkpoints = CheckpointList::for_network(config.network);
        Self::with_checkpoints(service, backend, store, config, checkpoints)
    }

    /// Processor with an explicit checkpoint list
    pub fn with_checkpoints(
        service: Arc<dyn BlockService>,
        backend: Arc<dyn ChainBackend>,
        store: BlockStore,
        config: ProcessorConfig,
        checkpoints: CheckpointList,
    ) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let downloader = Arc::new(BlockDownloader::new(service.clone(), store));
        Ok(Self {
            inner: Arc::new(ProcessorInner {
                service,
                backend,
                downloader,
                config,
                checkpoints,
                events,
                birthday: RwLock::new(None),
                context: RwLock::new(ActionContext::new()),
                running: Arc::new(AtomicBool::new(false)),
                cancel: Mutex::new(CancelToken::new()),
                run: Mutex::new(None),
            }),
        })
    }

    /// Initialize wallet state. Must be called before [`start`](Self::start).
    pub async fn prepare(
        &self,
        seed: Option<&[u8]>,
        viewing_keys: &[ViewingKey],
        birthday: BlockHeight,
    ) -> Result<()> {
        let network = Network::from_type(self.inner.config.network);
        if birthday < network.sapling_activation_height {
            return Err(Error::InvalidBirthday {
                birthday,
                activation: network.sapling_activation_height,
            });
        }
        self.inner
            .backend
            .initialize(seed, viewing_keys, birthday)
            .await?;
        *self.inner.birthday.write() = Some(birthday);
        info!("Processor prepared on {} with birthday {}", network.name, birthday);
        Ok(())
    }

    /// Whether a run is active
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Whether [`prepare`](Self::prepare) has succeeded since creation or the last wipe
    pub fn is_prepared(&self) -> bool {
        self.inner.birthday.read().is_some()
    }

    /// Start a sync run in the background.
    ///
    /// With `retry` set, transient failures and chain integrity errors are
    /// retried with backoff until the retry budget runs out; without it
    /// the first such failure ends the run. A no-op while a run is active.
    pub fn start(&self, retry: bool) -> Result<()> {
        let birthday = (*self.inner.birthday.read()).ok_or(Error::Unprepared)?;

        if self.inner.running.swap(true, Ordering::AcqRel) {
            debug!("Sync already running");
            return Ok(());
        }
        let guard = RunningGuard(self.inner.running.clone());

        let context = ActionContext::new();
        *self.inner.context.write() = context.clone();

        let cancel = CancelToken::new();
        *self.inner.cancel.lock() = cancel.clone();
        let run = SyncRun::new(
            SyncEnv {
                service: self.inner.service.clone(),
                backend: self.inner.backend.clone(),
                downloader: self.inner.downloader.clone(),
                config: self.inner.config.clone(),
                checkpoints: self.inner.checkpoints.clone(),
                birthday,
                events: self.inner.events.clone(),
                cancel,
            },
            context,
        );
        info!("Starting sync (retry: {})", retry);
        let (done_tx, done) = watch::channel(false);
        let outcome = Arc::new(Mutex::new(None));
        let slot = outcome.clone();
        tokio::spawn(async move {
            let result = run_loop(run, retry).await;
            *slot.lock() = Some(result);
            drop(guard);
            let _ = done_tx.send(true);
        });
        *self.inner.run.lock() = Some(RunHandle { done, outcome });
        Ok(())
    }

    /// Start a run and wait for it to end
    pub async fn sync(&self, retry: bool) -> Result<ProcessorState> {
        self.start(retry)?;
        self.wait().await
    }

    /// Wait for the active run to end and return its outcome. The outcome
    /// goes to the first waiter; later waiters and calls made when nothing
    /// has run get the current state.
    pub async fn wait(&self) -> Result<ProcessorState> {
        let run = self.inner.run.lock().clone();
        let Some(run) = run else {
            return Ok(self.state());
        };
        if !run.finished().await {
            error!("Sync task ended without an outcome");
            return Err(Error::Engine("sync task ended without an outcome".to_string()));
        }
        let outcome = run.outcome.lock().take();
        outcome.unwrap_or_else(|| Ok(self.state()))
    }

    /// Cancel the active run and leave the processor `Stopped`.
    /// Safe to call from any state, any number of times.
    pub async fn stop(&self) {
        self.inner.cancel.lock().cancel();
        let run = self.inner.run.lock().clone();
        if let Some(run) = run {
            if !run.finished().await {
                warn!("Sync task ended without an outcome");
            }
        }
        self.inner.downloader.stop_download().await;

        let context = self.context();
        if context.state() != ProcessorState::Stopped {
            let from = context.update(ProcessorState::Stopped);
            self.emit(ProcessorEvent::StateChanged {
                from,
                to: ProcessorState::Stopped,
            });
            self.emit(ProcessorEvent::Stopped);
        }
        context.clear_sync_range();
    }

    /// Subscribe to processor events
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.inner.events.subscribe()
    }

    /// Current state
    pub fn state(&self) -> ProcessorState {
        self.context().state()
    }

    /// State before the last transition
    pub fn prev_state(&self) -> Option<ProcessorState> {
        self.context().prev_state()
    }

    /// Consistent view of the current run
    pub fn snapshot(&self) -> ContextSnapshot {
        self.context().snapshot()
    }

    /// Download position of the current run, `None` without a sync range
    pub fn download_progress(&self) -> Result<Option<DownloadProgress>> {
        let Some(range) = self.context().sync_range() else {
            return Ok(None);
        };
        let highest = self.inner.downloader.store().highest_height()?;
        Ok(Some(DownloadProgress::for_range(range, highest)))
    }

    /// Stop any active run and discard scanned state and stored blocks
    /// above the height chosen by `policy`. Returns that height.
    pub async fn rewind(&self, policy: RewindPolicy) -> Result<BlockHeight> {
        let birthday = (*self.inner.birthday.read()).ok_or(Error::Unprepared)?;
        self.stop().await;

        let backend = &self.inner.backend;
        let floor = birthday.saturating_sub(1);
        let requested = match policy {
            RewindPolicy::Birthday => floor,
            RewindPolicy::Height(height) => height,
            RewindPolicy::Transaction { mined_height } => mined_height.saturating_sub(1),
            RewindPolicy::Quick => match backend.latest_scanned_height().await? {
                Some(scanned) => scanned.saturating_sub(self.inner.config.rewind_distance),
                None => floor,
            },
        }
        .max(floor);

        let target = backend.nearest_rewind_height(requested).await?.min(requested);
        backend.rewind_to(target).await?;
        let store = self.inner.downloader.store();
        if target < store.highest_height()? {
            store.rewind(target)?;
        }
        info!("Rewound to {} ({:?})", target, policy);
        Ok(target)
    }

    /// Stop, clear the block store and wipe wallet state. The processor
    /// must be prepared again before the next start.
    pub async fn wipe(&self) -> Result<()> {
        self.stop().await;
        self.inner.downloader.store().clear()?;
        self.inner.backend.wipe().await?;
        *self.inner.birthday.write() = None;
        info!("Processor wiped");
        Ok(())
    }

    /// Configuration in use
    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    /// Block store shared with the downloader
    pub fn store(&self) -> &BlockStore {
        self.inner.downloader.store()
    }

    fn context(&self) -> ActionContext {
        self.inner.context.read().clone()
    }

    fn emit(&self, event: ProcessorEvent) {
        let _ = self.inner.events.send(event);
    }
}

async fn run_loop(mut run: SyncRun, retry: bool) -> Result<ProcessorState> {
    loop {
        if run.env.cancel.is_cancelled() {
            return Ok(stopped(&run).await);
        }

        let state = run.context.state();
        match state {
            ProcessorState::Finished => {
                run.env.downloader.stop_download().await;
                let scanned_height = run.env.backend.latest_scanned_height().await.ok().flatten();
                info!("Sync finished at {:?}", scanned_height);
                run.emit(ProcessorEvent::Finished { scanned_height });
                return Ok(ProcessorState::Finished);
            }
            ProcessorState::Stopped => return Ok(ProcessorState::Stopped),
            _ => {}
        }

        let err = match run.step().await {
            Ok(next) => {
                run.transition(next);
                continue;
            }
            Err(e) => e,
        };

        match err.kind() {
            ErrorKind::Cancelled => return Ok(stopped(&run).await),
            ErrorKind::Transient | ErrorKind::ChainIntegrity if retry => {
                let attempt = match run.budget.consume(state, &err) {
                    Ok(attempt) => attempt,
                    Err(exhausted) => return failed(&run, state, exhausted).await,
                };
                let delay = run.env.config.retry.backoff_for(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    state,
                    attempt,
                    run.budget.max_attempts(),
                    err,
                    delay
                );
                run.emit(ProcessorEvent::Retrying {
                    state,
                    attempt,
                    max_attempts: run.budget.max_attempts(),
                    delay,
                    error: err.to_string(),
                });
                if !run.env.cancel.sleep(delay).await {
                    return Ok(stopped(&run).await);
                }
            }
            _ => return failed(&run, state, err).await,
        }
    }
}

async fn stopped(run: &SyncRun) -> ProcessorState {
    run.env.downloader.stop_download().await;
    if run.context.state() != ProcessorState::Stopped {
        run.transition(ProcessorState::Stopped);
        run.emit(ProcessorEvent::Stopped);
    }
    info!("Sync stopped");
    ProcessorState::Stopped
}

async fn failed(run: &SyncRun, state: ProcessorState, err: Error) -> Result<ProcessorState> {
    error!("Sync failed while {}: {}", state, err);
    run.env.downloader.stop_download().await;
    run.transition(ProcessorState::Stopped);
    run.emit(ProcessorEvent::Failed {
        state,
        attempts: run.budget.attempts(),
        error: err.to_string(),
    });
    run.emit(ProcessorEvent::Stopped);
    Err(err)
}
