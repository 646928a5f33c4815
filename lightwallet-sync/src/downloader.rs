//! Block downloader: streams compact blocks from the service into the
//! block store with a bounded buffer and publishes a download watermark.
//!
//! A single background task owns the stream. It holds at most
//! `max_buffer_size` blocks that have been pulled from the stream but not
//! yet written to the store; once that many are buffered it stops polling
//! the stream until they are persisted. The watermark only advances after a
//! write commits, so a height is never reported downloaded before it is
//! durable.

use crate::block_store::BlockStore;
use crate::cancel::CancelToken;
use crate::service::BlockService;
use crate::types::{BlockHeight, BlockRange, CompactBlock};
use crate::{Error, Result};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Failure recorded by the download task, replayed to every waiter
#[derive(Debug, Clone)]
enum DownloadFailure {
    Stream(String),
    Store(String),
    UnexpectedHeight {
        expected: BlockHeight,
        actual: BlockHeight,
    },
}

impl DownloadFailure {
    fn from_error(e: Error) -> Self {
        match e {
            Error::UnexpectedHeight { expected, actual } => {
                DownloadFailure::UnexpectedHeight { expected, actual }
            }
            Error::Storage(msg) => DownloadFailure::Store(msg),
            Error::StreamFailed(msg) => DownloadFailure::Stream(msg),
            other => DownloadFailure::Stream(other.to_string()),
        }
    }

    fn to_error(&self) -> Error {
        match self {
            DownloadFailure::Stream(msg) => Error::StreamFailed(msg.clone()),
            DownloadFailure::Store(msg) => Error::Storage(msg.clone()),
            DownloadFailure::UnexpectedHeight { expected, actual } => Error::UnexpectedHeight {
                expected: *expected,
                actual: *actual,
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
struct DownloadStatus {
    /// Highest height durably stored for the current range
    downloaded: Option<BlockHeight>,
    running: bool,
    finished: bool,
    failure: Option<DownloadFailure>,
}

struct DownloadTask {
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

/// Streams blocks for the sync range into the [`BlockStore`]
pub struct BlockDownloader {
    service: Arc<dyn BlockService>,
    store: BlockStore,
    sync_range: Mutex<Option<BlockRange>>,
    limit: watch::Sender<Option<BlockHeight>>,
    status: watch::Sender<DownloadStatus>,
    task: Mutex<Option<DownloadTask>>,
}

impl BlockDownloader {
    /// Create an idle downloader
    pub fn new(service: Arc<dyn BlockService>, store: BlockStore) -> Self {
        Self {
            service,
            store,
            sync_range: Mutex::new(None),
            limit: watch::channel(None).0,
            status: watch::channel(DownloadStatus::default()).0,
            task: Mutex::new(None),
        }
    }

    /// Store the downloader writes into
    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    /// Replace the sync range. No network activity until `start_download`.
    pub fn set_sync_range(&self, range: BlockRange) -> Result<()> {
        let range = BlockRange::new(range.lower(), range.upper())?;
        *self.sync_range.lock() = Some(range);
        self.limit.send_replace(None);
        debug!("Download sync range set to {}", range);
        Ok(())
    }

    /// Range currently targeted
    pub fn sync_range(&self) -> Option<BlockRange> {
        *self.sync_range.lock()
    }

    /// Cap the highest height the downloader will request
    pub fn set_download_limit(&self, height: BlockHeight) {
        self.limit.send_replace(Some(height));
    }

    /// Current download limit, `None` when capped only by the sync range
    pub fn download_limit(&self) -> Option<BlockHeight> {
        *self.limit.borrow()
    }

    /// Highest height stored for the current range
    pub fn downloaded_height(&self) -> Option<BlockHeight> {
        self.status.borrow().downloaded
    }

    /// Whether a download task is alive
    pub fn is_running(&self) -> bool {
        let alive = self
            .task
            .lock()
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false);
        alive && self.status.borrow().running
    }

    /// Begin consuming the service for the sync range with at most
    /// `max_buffer_size` blocks pulled but not yet persisted.
    ///
    /// Resumes after the highest stored height. A stored run that cannot
    /// be extended into the range without a gap is discarded first. Calling
    /// this while a download is alive is a no-op.
    pub fn start_download(&self, max_buffer_size: usize) -> Result<()> {
        let range = self.sync_range().ok_or(Error::SyncRangeNotSet)?;
        let max_buffer_size = max_buffer_size.max(1);

        let mut task_slot = self.task.lock();
        if let Some(task) = task_slot.take() {
            if !task.handle.is_finished() && self.status.borrow().running {
                *task_slot = Some(task);
                return Ok(());
            }
            // the worker clears `running` as its last step
            task.handle.abort();
        }

        let downloaded = self.resume_height(range)?;
        let next = downloaded.map(|h| h + 1).unwrap_or_else(|| range.lower());
        self.status.send_replace(DownloadStatus {
            downloaded,
            running: true,
            finished: next > range.upper(),
            failure: None,
        });

        info!(
            "Starting block download: {} -> {} (buffer {})",
            next,
            range.upper(),
            max_buffer_size
        );

        let cancel = CancelToken::new();
        let worker = DownloadWorker {
            service: self.service.clone(),
            store: self.store.clone(),
            range,
            max_buffer_size,
            cancel: cancel.clone(),
            limit: self.limit.subscribe(),
            status: self.status.clone(),
        };
        let handle = tokio::spawn(worker.run(next));
        *task_slot = Some(DownloadTask { cancel, handle });
        Ok(())
    }

    /// Suspend until every height of `range` is in the store.
    ///
    /// Raises the download limit to `range.upper()`. Returns
    /// `Err(Error::Cancelled)` if `cancel` fires first, which callers treat
    /// as a stop signal rather than a failure.
    pub async fn wait_until_requested_blocks_are_downloaded(
        &self,
        range: BlockRange,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.limit.send_modify(|limit| {
            if let Some(current) = limit {
                if *current < range.upper() {
                    *limit = Some(range.upper());
                }
            }
        });

        let mut status_rx = self.status.subscribe();
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            {
                let status = status_rx.borrow_and_update();
                if status.downloaded.is_some_and(|h| h >= range.upper()) {
                    return Ok(());
                }
                if let Some(failure) = &status.failure {
                    return Err(failure.to_error());
                }
                if !status.running {
                    return match self.sync_range() {
                        None => Err(Error::SyncRangeNotSet),
                        Some(_) => Err(Error::StreamFailed("download is not running".to_string())),
                    };
                }
                if status.finished {
                    return Err(Error::StreamFailed(format!(
                        "download finished at {:?} before reaching {}",
                        status.downloaded,
                        range.upper()
                    )));
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::StreamFailed("downloader dropped".to_string()));
                    }
                }
            }
        }
    }

    /// Cancel the in-flight stream and wait for the task to exit. Idempotent.
    pub async fn stop_download(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                if e.is_panic() {
                    warn!("Download task panicked: {}", e);
                }
            }
            debug!("Block download stopped");
        }
        self.status.send_modify(|status| status.running = false);
    }

    fn resume_height(&self, range: BlockRange) -> Result<Option<BlockHeight>> {
        let (lowest, latest) = (self.store.lowest_height()?, self.store.latest_height()?);
        match (lowest, latest) {
            (Some(lowest), Some(latest))
                if lowest <= range.lower() && latest + 1 >= range.lower() =>
            {
                Ok(if latest >= range.lower() { Some(latest) } else { None })
            }
            (Some(lowest), Some(latest)) => {
                warn!(
                    "Discarding cached blocks [{}, {}] that do not connect to {}",
                    lowest, latest, range
                );
                self.store.clear()?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

impl Drop for BlockDownloader {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel.cancel();
            task.handle.abort();
        }
    }
}

struct DownloadWorker {
    service: Arc<dyn BlockService>,
    store: BlockStore,
    range: BlockRange,
    max_buffer_size: usize,
    cancel: CancelToken,
    limit: watch::Receiver<Option<BlockHeight>>,
    status: watch::Sender<DownloadStatus>,
}

impl DownloadWorker {
    async fn run(mut self, mut next: BlockHeight) {
        let outcome = self.download_from(&mut next).await;
        self.status.send_modify(|status| {
            status.running = false;
            match outcome {
                Ok(finished) => status.finished = finished,
                Err(e) => {
                    warn!("Block download failed at height {}: {}", next, e);
                    status.failure = Some(DownloadFailure::from_error(e));
                }
            }
        });
    }

    /// Returns `Ok(true)` when the range is complete, `Ok(false)` if cancelled
    async fn download_from(&mut self, next: &mut BlockHeight) -> Result<bool> {
        while *next <= self.range.upper() {
            let Some(limit) = self.wait_for_limit(*next).await else {
                return Ok(false);
            };

            let request = BlockRange::new(*next, limit)?;
            debug!("Requesting blocks {}", request);
            let mut stream = self.service.block_stream(request);
            let mut buffer: Vec<CompactBlock> = Vec::with_capacity(self.max_buffer_size);

            loop {
                let item = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(false),
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(block)) if block.height > limit => {
                        self.flush(&mut buffer, next)?;
                        return Err(Error::StreamFailed(format!(
                            "block {} is past the end of {}",
                            block.height, request
                        )));
                    }
                    Some(Ok(block)) => {
                        buffer.push(block);
                        if buffer.len() >= self.max_buffer_size {
                            self.flush(&mut buffer, next)?;
                        }
                    }
                    Some(Err(e)) => {
                        self.flush(&mut buffer, next)?;
                        return Err(Error::StreamFailed(e.to_string()));
                    }
                    None => break,
                }
            }
            self.flush(&mut buffer, next)?;

            if *next <= limit {
                return Err(Error::StreamFailed(format!(
                    "stream for {} ended before height {}",
                    request, next
                )));
            }
        }
        Ok(true)
    }

    /// Wait until the limit admits `next`; `None` if cancelled
    async fn wait_for_limit(&mut self, next: BlockHeight) -> Option<BlockHeight> {
        loop {
            let limit = (*self.limit.borrow_and_update())
                .unwrap_or(self.range.upper())
                .min(self.range.upper());
            if limit >= next {
                return Some(limit);
            }
            debug!("Download paused at {} (limit {})", next, limit);
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                changed = self.limit.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    fn flush(&self, buffer: &mut Vec<CompactBlock>, next: &mut BlockHeight) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        if buffer[0].height != *next {
            return Err(Error::UnexpectedHeight {
                expected: *next,
                actual: buffer[0].height,
            });
        }
        self.store.write(buffer)?;
        let top = buffer[buffer.len() - 1].height;
        buffer.clear();
        *next = top + 1;
        self.status
            .send_modify(|status| status.downloaded = Some(top));
        Ok(())
    }
}
