//! Row models

use serde::{Deserialize, Serialize};

/// Wallet account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// ZIP-32 account index
    pub account_index: u32,
    /// Encoded unified full viewing key
    pub viewing_key: String,
    /// First height that can contain wallet activity
    pub birthday_height: u64,
    /// Optional user label
    pub name: Option<String>,
}

/// Header of a block the engine has scanned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedBlock {
    /// Block height
    pub height: u64,
    /// Block hash
    pub hash: Vec<u8>,
    /// Hash of the parent block
    pub prev_hash: Vec<u8>,
    /// Block time (Unix epoch)
    pub time: u32,
    /// Number of compact transactions in the block
    pub tx_count: u32,
}

/// Transaction the scanner attributed to the wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletTransaction {
    /// Transaction id
    pub txid: Vec<u8>,
    /// Mined height
    pub height: u64,
    /// Position inside the block
    pub tx_index: u32,
    /// Full transaction bytes once enhanced
    pub raw: Option<Vec<u8>>,
}

impl WalletTransaction {
    /// Whether the full transaction has been fetched
    pub fn is_enhanced(&self) -> bool {
        self.raw.is_some()
    }
}

/// Transparent unspent output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Funding transaction id
    pub txid: Vec<u8>,
    /// Output index inside the funding transaction
    pub output_index: u32,
    /// Receiving transparent address
    pub address: String,
    /// Locking script
    pub script: Vec<u8>,
    /// Value in zatoshis
    pub value_zat: i64,
    /// Mined height
    pub height: u64,
}
