//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use lightwallet_params::NetworkType;
use lightwallet_sync::{
    BlockHeight, BlockRange, BlockService, BlockStore, BlockStream, CompactBlock, CompactTx,
    Error, ProcessorConfig, RawTransaction, Result, RetryConfig, SubmitResult, TxId,
    UnspentOutput,
};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Deterministic block hash
pub fn block_hash(height: BlockHeight) -> Vec<u8> {
    Sha256::digest(height.to_le_bytes()).to_vec()
}

/// Hash-linked block at `height`
pub fn block(height: BlockHeight) -> CompactBlock {
    CompactBlock::empty(height, block_hash(height), block_hash(height.saturating_sub(1)))
}

/// Config tuned for tests: regtest, no jitter, millisecond backoff
pub fn test_config(batch_size: u64, max_buffer_size: usize) -> ProcessorConfig {
    let mut config = ProcessorConfig::for_network(NetworkType::Regtest);
    config.batch_size = batch_size;
    config.max_buffer_size = max_buffer_size;
    config.retry = RetryConfig {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config
}

/// In-process block service serving a hash-linked chain
pub struct MockBlockService {
    tip: AtomicU64,
    broken_link_at: Mutex<Option<BlockHeight>>,
    always_timeout: AtomicBool,
    over_deliver: AtomicU64,
    fail_stream_at: Mutex<Option<BlockHeight>>,
    wallet_txs: Mutex<HashMap<BlockHeight, Vec<u8>>>,
    utxos: Mutex<Vec<UnspentOutput>>,
    block_delay: Mutex<Option<Duration>>,
    observed_store: Mutex<Option<BlockStore>>,
    pub latest_calls: AtomicUsize,
    pub stream_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub utxo_calls: AtomicUsize,
    pub blocks_served: Arc<AtomicU64>,
    pub max_outstanding: Arc<AtomicU64>,
}

impl MockBlockService {
    pub fn new(tip: BlockHeight) -> Arc<Self> {
        Arc::new(Self {
            tip: AtomicU64::new(tip),
            broken_link_at: Mutex::new(None),
            always_timeout: AtomicBool::new(false),
            over_deliver: AtomicU64::new(0),
            fail_stream_at: Mutex::new(None),
            wallet_txs: Mutex::new(HashMap::new()),
            utxos: Mutex::new(Vec::new()),
            block_delay: Mutex::new(None),
            observed_store: Mutex::new(None),
            latest_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            utxo_calls: AtomicUsize::new(0),
            blocks_served: Arc::new(AtomicU64::new(0)),
            max_outstanding: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn set_tip(&self, tip: BlockHeight) {
        self.tip.store(tip, Ordering::SeqCst);
    }

    /// Serve `height` with a wrong parent hash once, then the fixed chain
    pub fn break_link_once_at(&self, height: BlockHeight) {
        *self.broken_link_at.lock() = Some(height);
    }

    /// Every call times out
    pub fn always_timeout(&self) {
        self.always_timeout.store(true, Ordering::SeqCst);
    }

    /// Keep streaming `extra` blocks past the end of every requested range
    pub fn over_deliver(&self, extra: u64) {
        self.over_deliver.store(extra, Ordering::SeqCst);
    }

    /// The next stream reaching `height` fails there
    pub fn fail_stream_once_at(&self, height: BlockHeight) {
        *self.fail_stream_at.lock() = Some(height);
    }

    /// Put a transaction with `txid` into the block at `height`
    pub fn add_wallet_tx(&self, height: BlockHeight, txid: Vec<u8>) {
        self.wallet_txs.lock().insert(height, txid);
    }

    pub fn set_utxos(&self, utxos: Vec<UnspentOutput>) {
        *self.utxos.lock() = utxos;
    }

    pub fn set_block_delay(&self, delay: Duration) {
        *self.block_delay.lock() = Some(delay);
    }

    /// Track blocks handed out but not yet in `store`
    pub fn observe_store(&self, store: BlockStore) {
        *self.observed_store.lock() = Some(store);
    }

    fn serve(&self, height: BlockHeight) -> CompactBlock {
        let mut block = block(height);
        if let Some(txid) = self.wallet_txs.lock().get(&height) {
            block.vtx.push(CompactTx {
                index: 0,
                txid: txid.clone(),
                ..Default::default()
            });
        }
        let mut broken = self.broken_link_at.lock();
        if *broken == Some(height) {
            block.prev_hash = vec![0xba; 32];
            *broken = None;
        }
        block
    }

    fn timed_out(&self) -> bool {
        self.always_timeout.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlockService for MockBlockService {
    async fn latest_block_height(&self) -> Result<BlockHeight> {
        self.latest_calls.fetch_add(1, Ordering::SeqCst);
        if self.timed_out() {
            return Err(Error::Timeout("get_latest_block".to_string()));
        }
        Ok(self.tip.load(Ordering::SeqCst))
    }

    fn block_stream(&self, range: BlockRange) -> BlockStream {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        if self.timed_out() {
            return stream::once(async {
                Err::<CompactBlock, _>(Error::Timeout("block stream".to_string()))
            })
            .boxed();
        }
        let upper = range.upper().min(self.tip.load(Ordering::SeqCst))
            + self.over_deliver.load(Ordering::SeqCst);
        let fail_at = {
            let mut fail = self.fail_stream_at.lock();
            match *fail {
                Some(h) if range.contains(h) => fail.take(),
                _ => None,
            }
        };

        let mut items: Vec<Result<CompactBlock>> = Vec::new();
        for height in range.lower()..=upper {
            if fail_at == Some(height) {
                items.push(Err(Error::StreamFailed(format!(
                    "connection reset at {}",
                    height
                ))));
                break;
            }
            items.push(Ok(self.serve(height)));
        }

        let delay = *self.block_delay.lock();
        let observed = self.observed_store.lock().clone();
        let served = self.blocks_served.clone();
        let max_outstanding = self.max_outstanding.clone();
        stream::iter(items)
            .then(move |item| {
                let observed = observed.clone();
                let served = served.clone();
                let max_outstanding = max_outstanding.clone();
                async move {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    if let Ok(block) = &item {
                        served.fetch_add(1, Ordering::SeqCst);
                        if let Some(store) = observed {
                            let base = store
                                .latest_height()
                                .ok()
                                .flatten()
                                .filter(|h| *h >= range.lower())
                                .unwrap_or(range.lower().saturating_sub(1));
                            max_outstanding
                                .fetch_max(block.height.saturating_sub(base), Ordering::SeqCst);
                        }
                    }
                    item
                }
            })
            .boxed()
    }

    async fn submit(&self, _raw_tx: &[u8]) -> Result<SubmitResult> {
        Ok(SubmitResult {
            code: 0,
            message: String::new(),
        })
    }

    async fn fetch_transaction(&self, txid: &TxId) -> Result<RawTransaction> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.timed_out() {
            return Err(Error::Timeout("get_transaction".to_string()));
        }
        let mut data = vec![0x05];
        data.extend_from_slice(&txid.0);
        Ok(RawTransaction { data, height: None })
    }

    async fn fetch_utxos(
        &self,
        addresses: &[String],
        _start_height: BlockHeight,
    ) -> Result<Vec<UnspentOutput>> {
        self.utxo_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .utxos
            .lock()
            .iter()
            .filter(|u| addresses.contains(&u.address))
            .cloned()
            .collect())
    }
}
