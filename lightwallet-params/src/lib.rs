//! Network parameters and constants for the light wallet sync engine
//!
//! This crate provides network-specific activation heights, default wallet
//! birthdays and checkpoint data used to bound chain rewinds.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod checkpoints;
pub mod network;

pub use checkpoints::{Checkpoint, CheckpointList};
pub use network::{Network, NetworkType};

/// Error types for parameter operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid network specified
    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    /// Invalid block height
    #[error("Invalid block height: {0}")]
    InvalidHeight(u64),

    /// Checkpoint not found
    #[error("No checkpoint found for height {0}")]
    CheckpointNotFound(u64),

    /// Checkpoint file could not be parsed
    #[error("Invalid checkpoint data: {0}")]
    InvalidCheckpoint(#[from] serde_json::Error),
}

/// Result type for parameter operations
pub type Result<T> = std::result::Result<T, Error>;
