//! Validation/scan engine interface and the SQLite reference engine.
//!
//! The processor never touches wallet tables itself; everything it learns
//! about wallet state goes through [`ChainBackend`].

use crate::block_store::BlockStore;
use crate::types::{BlockHeight, BlockRange, CompactTx, RawTransaction, TxId, UnspentOutput, ViewingKey};
use crate::{Error, Result};
use async_trait::async_trait;
use lightwallet_storage::{
    Account, AccountRepository, CachingAccountRepository, Database, ScannedBlock,
    SqliteAccountRepository, SyncStateRow, SyncStateStorage, Utxo, WalletStorage,
    WalletTransaction,
};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of chain validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainValidity {
    /// Every block links to its parent and to the scanned anchor
    Valid,
    /// First height whose parent hash does not match
    InvalidAt(BlockHeight),
}

/// Scanned wallet transaction still missing its full body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransaction {
    /// Transaction id
    pub txid: TxId,
    /// Height the transaction was mined at
    pub height: BlockHeight,
}

/// Note scanning and chain-state engine
#[async_trait]
pub trait ChainBackend: Send + Sync {
    /// Set up wallet state for the given keys and birthday
    async fn initialize(
        &self,
        seed: Option<&[u8]>,
        viewing_keys: &[ViewingKey],
        birthday: BlockHeight,
    ) -> Result<()>;

    /// Check that the stored blocks in `range` form a chain anchored on the
    /// last scanned block
    async fn validate_chain(&self, store: &BlockStore, range: BlockRange) -> Result<ChainValidity>;

    /// Scan stored blocks in `range` into wallet state
    async fn scan_blocks(&self, store: &BlockStore, range: BlockRange) -> Result<()>;

    /// Discard wallet state above `height`
    async fn rewind_to(&self, height: BlockHeight) -> Result<()>;

    /// Highest height at or below `height` the wallet can rewind to
    async fn nearest_rewind_height(&self, height: BlockHeight) -> Result<BlockHeight>;

    /// Highest scanned height, `None` before the first scan
    async fn latest_scanned_height(&self) -> Result<Option<BlockHeight>>;

    /// Remember the chain tip a sync range was computed against
    async fn record_target_height(&self, _height: BlockHeight) -> Result<()> {
        Ok(())
    }

    /// Wallet transactions in `range` whose full body has not been fetched
    async fn transactions_to_enhance(&self, range: BlockRange) -> Result<Vec<PendingTransaction>>;

    /// Store a full transaction body
    async fn store_transaction(&self, txid: &TxId, tx: &RawTransaction) -> Result<()>;

    /// Transparent addresses whose UTXOs should be tracked
    async fn transparent_receivers(&self) -> Result<Vec<String>>;

    /// Replace the UTXO set of `addresses`
    async fn put_utxos(&self, addresses: &[String], utxos: &[UnspentOutput]) -> Result<()>;

    /// Delete all wallet state
    async fn wipe(&self) -> Result<()>;
}

/// Decides whether a compact transaction belongs to the wallet
pub type RelevanceFilter = Arc<dyn Fn(&CompactTx) -> bool + Send + Sync>;

/// Reference engine backed by the SQLite wallet database.
///
/// Validation checks hash linkage only. Scanning records block headers and
/// marks transactions selected by the relevance filter for enhancement;
/// trial decryption is left to a real engine behind the same trait.
pub struct WalletBackend {
    db: Arc<Database>,
    accounts: CachingAccountRepository<SqliteAccountRepository>,
    relevance: RelevanceFilter,
    receivers: RwLock<Vec<String>>,
}

impl WalletBackend {
    /// Engine over an open database
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            accounts: CachingAccountRepository::new(SqliteAccountRepository::new(db.clone())),
            db,
            relevance: Arc::new(|_| false),
            receivers: RwLock::new(Vec::new()),
        }
    }

    /// Open (or create) the wallet database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(Arc::new(Database::open(path)?)))
    }

    /// Use `filter` to pick wallet transactions while scanning
    pub fn with_relevance_filter(mut self, filter: RelevanceFilter) -> Self {
        self.relevance = filter;
        self
    }

    /// Track UTXOs for `addresses`
    pub fn set_transparent_receivers(&self, addresses: Vec<String>) {
        *self.receivers.write() = addresses;
    }

    /// Cached account view
    pub fn accounts(&self) -> &CachingAccountRepository<SqliteAccountRepository> {
        &self.accounts
    }

    /// Underlying database
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Persisted scan watermark, observed tip and last rewind height
    pub fn sync_state(&self) -> Result<SyncStateRow> {
        Ok(SyncStateStorage::new(&self.db).load_sync_state()?)
    }

    fn wallet(&self) -> WalletStorage<'_> {
        WalletStorage::new(&self.db)
    }
}

#[async_trait]
impl ChainBackend for WalletBackend {
    async fn initialize(
        &self,
        _seed: Option<&[u8]>,
        viewing_keys: &[ViewingKey],
        birthday: BlockHeight,
    ) -> Result<()> {
        if viewing_keys.is_empty() {
            return Err(Error::Config("at least one viewing key is required".to_string()));
        }
        for (index, key) in viewing_keys.iter().enumerate() {
            let account_index = index as u32;
            let existing = self.accounts.find_by(account_index)?;
            let birthday_height = existing
                .as_ref()
                .filter(|a| a.viewing_key == key.0)
                .map(|a| a.birthday_height.min(birthday))
                .unwrap_or(birthday);
            self.accounts.update(&Account {
                account_index,
                viewing_key: key.0.clone(),
                birthday_height,
                name: existing.and_then(|a| a.name),
            })?;
        }
        info!(
            "Wallet initialized with {} account(s), birthday {}",
            viewing_keys.len(),
            birthday
        );
        Ok(())
    }

    async fn validate_chain(&self, store: &BlockStore, range: BlockRange) -> Result<ChainValidity> {
        let blocks = store.load_range(range)?;
        if blocks.len() as u64 != range.len() {
            return Err(Error::Engine(format!(
                "block store holds {} of {} blocks in {}",
                blocks.len(),
                range.len(),
                range
            )));
        }

        let anchor = match range.lower().checked_sub(1) {
            Some(parent) => self.wallet().scanned_block(parent)?,
            None => None,
        };
        if let (Some(anchor), Some(first)) = (anchor.as_ref(), blocks.first()) {
            if first.prev_hash != anchor.hash {
                debug!(
                    "Block {} does not link to scanned anchor {}",
                    first.height, anchor.height
                );
                return Ok(ChainValidity::InvalidAt(first.height));
            }
        }

        for pair in blocks.windows(2) {
            if pair[1].prev_hash != pair[0].hash {
                return Ok(ChainValidity::InvalidAt(pair[1].height));
            }
        }
        Ok(ChainValidity::Valid)
    }

    async fn scan_blocks(&self, store: &BlockStore, range: BlockRange) -> Result<()> {
        if let Some(last) = self.wallet().last_scanned_block()? {
            if last.height + 1 != range.lower() {
                return Err(Error::Engine(format!(
                    "scan of {} does not continue from scanned height {}",
                    range, last.height
                )));
            }
        }

        let blocks = store.load_range(range)?;
        let mut scanned = Vec::with_capacity(blocks.len());
        let mut found = Vec::new();
        for block in &blocks {
            scanned.push(ScannedBlock {
                height: block.height,
                hash: block.hash.clone(),
                prev_hash: block.prev_hash.clone(),
                time: block.time,
                tx_count: block.vtx.len() as u32,
            });
            found.extend(
                block
                    .vtx
                    .iter()
                    .filter(|tx| (self.relevance)(tx))
                    .map(|tx| WalletTransaction {
                        txid: tx.txid.clone(),
                        height: block.height,
                        tx_index: tx.index as u32,
                        raw: None,
                    }),
            );
        }
        self.wallet().record_scanned(&scanned, &found)?;
        debug!(
            "Scanned {} blocks in {}, {} wallet transaction(s)",
            scanned.len(),
            range,
            found.len()
        );
        Ok(())
    }

    async fn rewind_to(&self, height: BlockHeight) -> Result<()> {
        self.wallet().truncate_above_height(height)?;
        Ok(())
    }

    async fn nearest_rewind_height(&self, height: BlockHeight) -> Result<BlockHeight> {
        Ok(self
            .wallet()
            .scanned_height_at_or_below(height)?
            .unwrap_or(height))
    }

    async fn latest_scanned_height(&self) -> Result<Option<BlockHeight>> {
        Ok(self.wallet().last_scanned_block()?.map(|b| b.height))
    }

    async fn record_target_height(&self, height: BlockHeight) -> Result<()> {
        SyncStateStorage::new(&self.db).update_target_height(height)?;
        Ok(())
    }

    async fn transactions_to_enhance(&self, range: BlockRange) -> Result<Vec<PendingTransaction>> {
        Ok(self
            .wallet()
            .transactions_to_enhance(range.lower(), range.upper())?
            .into_iter()
            .map(|tx| PendingTransaction {
                txid: TxId(tx.txid),
                height: tx.height,
            })
            .collect())
    }

    async fn store_transaction(&self, txid: &TxId, tx: &RawTransaction) -> Result<()> {
        let wallet = self.wallet();
        let height = match tx.height {
            Some(height) => height,
            None => wallet.transaction(&txid.0)?.map(|t| t.height).unwrap_or(0),
        };
        wallet.store_raw_transaction(&txid.0, height, &tx.data)?;
        Ok(())
    }

    async fn transparent_receivers(&self) -> Result<Vec<String>> {
        Ok(self.receivers.read().clone())
    }

    async fn put_utxos(&self, addresses: &[String], utxos: &[UnspentOutput]) -> Result<()> {
        let rows: Vec<Utxo> = utxos
            .iter()
            .map(|u| Utxo {
                txid: u.txid.clone(),
                output_index: u.index,
                address: u.address.clone(),
                script: u.script.clone(),
                value_zat: u.value_zat,
                height: u.height,
            })
            .collect();
        self.wallet().replace_utxos(addresses, &rows)?;
        Ok(())
    }

    async fn wipe(&self) -> Result<()> {
        self.wallet().wipe()?;
        self.accounts.invalidate();
        info!("Wallet state wiped");
        Ok(())
    }
}
