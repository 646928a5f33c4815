//! Blockchain checkpoints used as rewind floors and sync starting points

use crate::{Error, NetworkType, Result};
use serde::{Deserialize, Serialize};

/// A blockchain checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Block height
    pub height: u64,
    /// Block hash (hex, display order)
    pub hash: String,
    /// Timestamp (Unix epoch)
    #[serde(alias = "time")]
    pub timestamp: u64,
    /// Serialized Sapling commitment tree at this height (hex)
    #[serde(default, alias = "saplingTree")]
    pub sapling_tree: String,
}

/// List of checkpoints, kept sorted by height
#[derive(Debug, Clone, Default)]
pub struct CheckpointList {
    checkpoints: Vec<Checkpoint>,
}

impl CheckpointList {
    /// Create a new checkpoint list
    pub fn new(checkpoints: Vec<Checkpoint>) -> Self {
        let mut cp = Self { checkpoints };
        cp.sort();
        cp
    }

    /// Parse a JSON array of checkpoints
    pub fn from_json(json: &str) -> Result<Self> {
        let checkpoints: Vec<Checkpoint> = serde_json::from_str(json)?;
        Ok(Self::new(checkpoints))
    }

    /// Bundled checkpoints for a network
    pub fn for_network(network: NetworkType) -> Self {
        match network {
            NetworkType::Mainnet => Self::mainnet(),
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Regtest => Self::default(),
        }
    }

    /// Get mainnet checkpoints
    pub fn mainnet() -> Self {
        Self::new(vec![Checkpoint {
            height: 419_200,
            hash: "00000000025a57200d898ac7f21e26bf29028bbe96ec46e05b2c17cc9db9e4f3".to_string(),
            timestamp: 1_540_779_337,
            sapling_tree: "000000".to_string(),
        }])
    }

    /// Get testnet checkpoints
    pub fn testnet() -> Self {
        Self::new(vec![Checkpoint {
            height: 280_000,
            hash: "000420e7fcc3a49d729479fb0b560dd7b8617b178a08e9e389620a9d1dd6361a".to_string(),
            timestamp: 1_535_262_293,
            sapling_tree: "000000".to_string(),
        }])
    }

    /// Merge additional checkpoints, replacing entries at the same height
    pub fn extend(&mut self, other: CheckpointList) {
        for cp in other.checkpoints {
            self.checkpoints.retain(|existing| existing.height != cp.height);
            self.checkpoints.push(cp);
        }
        self.sort();
    }

    fn sort(&mut self) {
        self.checkpoints.sort_by_key(|cp| cp.height);
        self.checkpoints.dedup_by_key(|cp| cp.height);
    }

    /// Get checkpoint at or before given height
    pub fn checkpoint_at_height(&self, height: u64) -> Result<&Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .find(|cp| cp.height <= height)
            .ok_or(Error::CheckpointNotFound(height))
    }

    /// Get all checkpoints
    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Get latest checkpoint
    pub fn latest(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// Get checkpoint count
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CheckpointList {
        CheckpointList::from_json(
            r#"[
                {"height": 2000, "hash": "bb", "time": 1700000100, "saplingTree": "01"},
                {"height": 1000, "hash": "aa", "timestamp": 1700000000}
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn test_mainnet_checkpoints() {
        let checkpoints = CheckpointList::mainnet();
        assert!(!checkpoints.is_empty());
        assert_eq!(checkpoints.latest().unwrap().height, 419_200);
        assert!(CheckpointList::for_network(NetworkType::Regtest).is_empty());
    }

    #[test]
    fn test_checkpoint_at_height() {
        let checkpoints = sample();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints.checkpoint_at_height(1000).unwrap().height, 1000);
        assert_eq!(checkpoints.checkpoint_at_height(1999).unwrap().height, 1000);
        assert_eq!(checkpoints.checkpoint_at_height(5000).unwrap().height, 2000);
    }

    #[test]
    fn test_checkpoint_not_found() {
        let checkpoints = sample();
        let result = checkpoints.checkpoint_at_height(100);
        assert!(matches!(result, Err(Error::CheckpointNotFound(100))));
    }

    #[test]
    fn test_extend_replaces_same_height() {
        let mut checkpoints = sample();
        checkpoints.extend(CheckpointList::new(vec![Checkpoint {
            height: 2000,
            hash: "cc".to_string(),
            timestamp: 1,
            sapling_tree: String::new(),
        }]));
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints.checkpoint_at_height(2000).unwrap().hash, "cc");
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            CheckpointList::from_json("{not json"),
            Err(Error::InvalidCheckpoint(_))
        ));
    }
}
