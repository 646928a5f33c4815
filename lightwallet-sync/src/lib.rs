//! Compact block sync engine for light wallets
//!
//! Downloads compact blocks from a lightwalletd-compatible service into a
//! local block store, validates and scans them through a pluggable engine,
//! and recovers from chain reorgs by rewinding and re-downloading.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

mod actions;
pub mod backend;
pub mod block_store;
pub mod cancel;
pub mod config;
pub mod context;
pub mod downloader;
pub mod error;
pub mod event_logger;
pub mod events;
pub mod processor;
pub mod progress;
pub mod proto_types;
pub mod service;
pub mod types;
pub mod validation;

pub use backend::{ChainBackend, ChainValidity, PendingTransaction, RelevanceFilter, WalletBackend};
pub use block_store::{cache_path_for_endpoint, BlockStore, BLOCK_CACHE_DIR_ENV};
pub use cancel::CancelToken;
pub use config::{
    default_data_dir, ProcessorConfig, RetryConfig, BATCH_SIZE_ENV, DEFAULT_BATCH_SIZE,
    DEFAULT_MAX_BUFFER_SIZE, DEFAULT_MAX_REORG_SIZE, DEFAULT_REWIND_DISTANCE, WALLET_DB_PATH_ENV,
};
pub use context::{ActionContext, ContextSnapshot, ProcessorState};
pub use downloader::BlockDownloader;
pub use error::{Error, ErrorKind, Result};
pub use event_logger::{EventLogger, LoggedEvent};
pub use events::ProcessorEvent;
pub use processor::{CompactBlockProcessor, RewindPolicy};
pub use progress::{BatchReport, DownloadProgress, ProcessorMetrics};
pub use service::{BlockService, BlockStream, LightwalletdConfig, LightwalletdService};
pub use types::{
    BlockHeight, BlockRange, CompactAction, CompactBlock, CompactOutput, CompactTx,
    RawTransaction, SubmitResult, TxId, UnspentOutput, ViewingKey,
};
pub use validation::{compute_rewind_target, RetryBudget};
