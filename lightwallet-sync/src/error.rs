//! Error types for sync operations

use crate::context::ProcessorState;
use crate::types::BlockHeight;

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// How the processor reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller misuse; fail fast, never retried
    Configuration,
    /// Transport failure or timeout; retried under the retry budget
    Transient,
    /// Chain does not link up; handled by rewind-and-retry
    ChainIntegrity,
    /// Local storage or engine failure; fatal for the run
    Resource,
    /// Cooperative stop; not a failure
    Cancelled,
}

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Range with `lower > upper`
    #[error("Invalid block range [{lower}, {upper}]")]
    InvalidRange {
        /// Requested lower bound
        lower: BlockHeight,
        /// Requested upper bound
        upper: BlockHeight,
    },

    /// Download started before a sync range was set
    #[error("Sync range not set")]
    SyncRangeNotSet,

    /// Block stream failed or timed out mid-range
    #[error("Block stream failed: {0}")]
    StreamFailed(String),

    /// Block store rewind target is above the highest stored height
    #[error("Rewind target {target} is above latest stored height {latest}")]
    RewindTargetAboveLatest {
        /// Requested rewind height
        target: BlockHeight,
        /// Highest stored height
        latest: BlockHeight,
    },

    /// Block arrived out of order or duplicated
    #[error("Unexpected block height: expected {expected}, got {actual}")]
    UnexpectedHeight {
        /// Next contiguous height
        expected: BlockHeight,
        /// Height that arrived
        actual: BlockHeight,
    },

    /// Processor used before `prepare` (or after `wipe`)
    #[error("Synchronizer is unprepared")]
    Unprepared,

    /// Wallet birthday below the network's activation height
    #[error("Invalid wallet birthday {birthday}, must be at least {activation}")]
    InvalidBirthday {
        /// Requested birthday
        birthday: BlockHeight,
        /// Network activation height
        activation: BlockHeight,
    },

    /// Retry budget exhausted
    #[error("Maximum retry attempts ({attempts}) reached while {state}: {last_error}")]
    MaxAttemptsReached {
        /// Attempts consumed
        attempts: u32,
        /// Action that was being retried
        state: ProcessorState,
        /// Last error observed
        last_error: String,
    },

    /// Validation found a broken hash link at `height`
    #[error("Chain validation failed at height {height}")]
    ChainValidation {
        /// First height that does not link to its parent
        height: BlockHeight,
    },

    /// Rewind target could not be determined or applied
    #[error("Rewind failed: {0}")]
    Rewind(String),

    /// Validation/scan engine failure
    #[error("Engine error: {0}")]
    Engine(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Single call or stream message timed out
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Transaction broadcast rejected
    #[error("Submit failed ({code}): {message}")]
    SubmitFailed {
        /// Node error code
        code: i32,
        /// Node error message
        message: String,
    },

    /// Configuration could not be loaded
    #[error("Config error: {0}")]
    Config(String),

    /// Operation cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Status error
    #[error("Status error: {0}")]
    Status(#[from] tonic::Status),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify for retry decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidRange { .. }
            | Error::SyncRangeNotSet
            | Error::Unprepared
            | Error::InvalidBirthday { .. }
            | Error::Config(_)
            | Error::SubmitFailed { .. } => ErrorKind::Configuration,
            Error::StreamFailed(_)
            | Error::Network(_)
            | Error::Timeout(_)
            | Error::Transport(_) => ErrorKind::Transient,
            Error::Status(status) => match status.code() {
                tonic::Code::InvalidArgument
                | tonic::Code::NotFound
                | tonic::Code::Unimplemented
                | tonic::Code::PermissionDenied
                | tonic::Code::Unauthenticated => ErrorKind::Configuration,
                _ => ErrorKind::Transient,
            },
            Error::ChainValidation { .. } | Error::UnexpectedHeight { .. } => {
                ErrorKind::ChainIntegrity
            }
            Error::Cancelled => ErrorKind::Cancelled,
            Error::RewindTargetAboveLatest { .. }
            | Error::MaxAttemptsReached { .. }
            | Error::Rewind(_)
            | Error::Engine(_)
            | Error::Storage(_)
            | Error::Io(_) => ErrorKind::Resource,
        }
    }

    /// Whether the processor may retry the failed action
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Whether this is a cooperative cancellation
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

impl From<lightwallet_storage::Error> for Error {
    fn from(e: lightwallet_storage::Error) -> Self {
        Error::Storage(format!("{}", e))
    }
}
