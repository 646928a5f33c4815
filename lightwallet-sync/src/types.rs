//! Core sync data types

use crate::{proto_types, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Block height
pub type BlockHeight = u64;

/// Inclusive block range `[lower, upper]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    lower: BlockHeight,
    upper: BlockHeight,
}

impl BlockRange {
    /// Create a range; fails with [`Error::InvalidRange`] if `lower > upper`
    pub fn new(lower: BlockHeight, upper: BlockHeight) -> Result<Self> {
        if lower > upper {
            return Err(Error::InvalidRange { lower, upper });
        }
        Ok(Self { lower, upper })
    }

    /// Lowest height in the range
    pub fn lower(&self) -> BlockHeight {
        self.lower
    }

    /// Highest height in the range
    pub fn upper(&self) -> BlockHeight {
        self.upper
    }

    /// Number of heights covered
    pub fn len(&self) -> u64 {
        self.upper - self.lower + 1
    }

    /// Always false; a range holds at least one height
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `height` falls inside the range
    pub fn contains(&self, height: BlockHeight) -> bool {
        height >= self.lower && height <= self.upper
    }

    /// Sub-range starting at `start` holding at most `max_len` heights,
    /// `None` once `start` is past the end
    pub fn batch_from(&self, start: BlockHeight, max_len: u64) -> Option<BlockRange> {
        let start = start.max(self.lower);
        if start > self.upper || max_len == 0 {
            return None;
        }
        let end = start.saturating_add(max_len - 1).min(self.upper);
        Some(BlockRange {
            lower: start,
            upper: end,
        })
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lower, self.upper)
    }
}

/// Compact Sapling output (note commitment, ephemeral key, ciphertext prefix)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactOutput {
    pub cmu: Vec<u8>,
    pub ephemeral_key: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Compact Orchard action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactAction {
    pub nullifier: Vec<u8>,
    pub cmx: Vec<u8>,
    pub ephemeral_key: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Shielded parts of a transaction needed for trial decryption
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompactTx {
    /// Position in the block
    pub index: u64,
    /// Transaction id
    pub txid: Vec<u8>,
    pub fee: u32,
    /// Sapling nullifiers revealed by spends
    pub spends: Vec<Vec<u8>>,
    pub outputs: Vec<CompactOutput>,
    pub actions: Vec<CompactAction>,
}

/// Minimal per-block data used by the scanner; immutable once stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactBlock {
    pub height: BlockHeight,
    pub hash: Vec<u8>,
    pub prev_hash: Vec<u8>,
    pub time: u32,
    pub proto_version: u32,
    pub header: Vec<u8>,
    pub vtx: Vec<CompactTx>,
}

impl CompactBlock {
    /// Block with no transactions, used when only the hash chain matters
    pub fn empty(height: BlockHeight, hash: Vec<u8>, prev_hash: Vec<u8>) -> Self {
        Self {
            height,
            hash,
            prev_hash,
            time: 0,
            proto_version: 1,
            header: Vec::new(),
            vtx: Vec::new(),
        }
    }

    /// Hash in the byte-reversed hex form block explorers show
    pub fn display_hash(&self) -> String {
        let mut bytes = self.hash.clone();
        bytes.reverse();
        hex::encode(bytes)
    }
}

impl From<proto_types::CompactBlock> for CompactBlock {
    fn from(block: proto_types::CompactBlock) -> Self {
        Self {
            height: block.height,
            hash: block.hash,
            prev_hash: block.prev_hash,
            time: block.time,
            proto_version: block.proto_version,
            header: block.header,
            vtx: block
                .vtx
                .into_iter()
                .map(|tx| CompactTx {
                    index: tx.index,
                    txid: tx.hash,
                    fee: tx.fee,
                    spends: tx.spends.into_iter().map(|s| s.nf).collect(),
                    outputs: tx
                        .outputs
                        .into_iter()
                        .map(|o| CompactOutput {
                            cmu: o.cmu,
                            ephemeral_key: o.ephemeral_key,
                            ciphertext: o.ciphertext,
                        })
                        .collect(),
                    actions: tx
                        .actions
                        .into_iter()
                        .map(|a| CompactAction {
                            nullifier: a.nullifier,
                            cmx: a.cmx,
                            ephemeral_key: a.ephemeral_key,
                            ciphertext: a.ciphertext,
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Transaction id (internal byte order)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub Vec<u8>);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bytes = self.0.clone();
        bytes.reverse();
        f.write_str(&hex::encode(bytes))
    }
}

/// Full transaction as returned by the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransaction {
    pub data: Vec<u8>,
    /// Mined height, `None` while in the mempool
    pub height: Option<BlockHeight>,
}

/// Outcome of a transaction broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResult {
    pub code: i32,
    pub message: String,
}

impl SubmitResult {
    /// Whether the node accepted the transaction
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Transparent unspent output reported by the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub address: String,
    pub txid: Vec<u8>,
    pub index: u32,
    pub script: Vec<u8>,
    pub value_zat: i64,
    pub height: BlockHeight,
}

/// Encoded unified full viewing key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewingKey(pub String);
