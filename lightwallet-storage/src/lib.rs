//! SQLite-backed wallet storage
//!
//! Holds the wallet-side state the sync engine produces: accounts, scanned
//! block headers, wallet transactions awaiting enhancement, transparent UTXOs
//! and the persisted sync watermark.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod accounts;
pub mod database;
pub mod error;
pub mod migrations;
pub mod models;
pub mod sync_state;
pub mod wallet;

pub use accounts::{AccountRepository, CachingAccountRepository, SqliteAccountRepository};
pub use database::Database;
pub use error::{Error, Result};
pub use models::{Account, ScannedBlock, Utxo, WalletTransaction};
pub use sync_state::{SyncStateRow, SyncStateStorage};
pub use wallet::WalletStorage;
