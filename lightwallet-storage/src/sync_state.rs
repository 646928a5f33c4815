//! Sync state storage with retry/backoff for SQLITE_BUSY
//!
//! The row tracks how far the scanner has progressed, the chain tip observed
//! at the last sync and the height of the last rewind.

use crate::{Database, Error, Result};
use rusqlite::{params, ErrorCode, OptionalExtension};
use std::thread;
use std::time::Duration;

/// Maximum retry attempts for SQLITE_BUSY
pub const MAX_BUSY_RETRIES: u32 = 5;

/// Base backoff duration in milliseconds
pub const BASE_BACKOFF_MS: u64 = 50;

/// Maximum backoff duration in milliseconds
pub const MAX_BACKOFF_MS: u64 = 1000;

/// Sync state record
#[derive(Debug, Clone)]
pub struct SyncStateRow {
    /// Highest height scanned into the wallet
    pub scanned_height: u64,
    /// Chain tip seen when the last sync range was computed
    pub target_height: u64,
    /// Height the wallet was last rewound to
    pub last_rewind_height: u64,
    /// Last update timestamp (ISO 8601)
    pub updated_at: String,
}

impl Default for SyncStateRow {
    fn default() -> Self {
        Self {
            scanned_height: 0,
            target_height: 0,
            last_rewind_height: 0,
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Sync state storage operations with retry logic
pub struct SyncStateStorage<'a> {
    db: &'a Database,
}

impl<'a> SyncStateStorage<'a> {
    /// Create new sync state storage
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Load current sync state
    pub fn load_sync_state(&self) -> Result<SyncStateRow> {
        with_busy_retry(|| {
            let row = self
                .db
                .conn()
                .query_row(
                    r#"
                    SELECT scanned_height, target_height, last_rewind_height, updated_at
                    FROM sync_state
                    WHERE id = 1
                    "#,
                    [],
                    |row| {
                        Ok(SyncStateRow {
                            scanned_height: row.get(0)?,
                            target_height: row.get(1)?,
                            last_rewind_height: row.get(2)?,
                            updated_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;

            Ok(row.unwrap_or_default())
        })
    }

    /// Update the scanned watermark
    pub fn update_scanned_height(&self, height: u64) -> Result<()> {
        self.update_column("scanned_height", height)
    }

    /// Update the observed chain tip
    pub fn update_target_height(&self, height: u64) -> Result<()> {
        self.update_column("target_height", height)
    }

    fn update_column(&self, column: &'static str, height: u64) -> Result<()> {
        let updated_at = chrono::Utc::now().to_rfc3339();
        let sql = format!(
            "UPDATE sync_state SET {} = ?1, updated_at = ?2 WHERE id = 1",
            column
        );
        with_busy_retry(|| {
            self.db.conn().execute(&sql, params![height, updated_at])?;
            Ok(())
        })
    }
}

/// Run `f`, retrying with backoff while SQLite reports SQLITE_BUSY
pub(crate) fn with_busy_retry<F, T>(mut f: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempts = 0;

    loop {
        match f() {
            Ok(result) => return Ok(result),
            Err(Error::Database(ref e)) if is_busy_error(e) && attempts < MAX_BUSY_RETRIES => {
                attempts += 1;
                let backoff = calculate_backoff(attempts);
                tracing::debug!(
                    "SQLITE_BUSY (attempt {}/{}), retrying in {}ms",
                    attempts,
                    MAX_BUSY_RETRIES,
                    backoff
                );
                thread::sleep(Duration::from_millis(backoff));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Check if error is SQLITE_BUSY
fn is_busy_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: ErrorCode::DatabaseBusy,
                ..
            },
            _
        )
    )
}

/// Calculate exponential backoff with jitter
fn calculate_backoff(attempt: u32) -> u64 {
    let base = BASE_BACKOFF_MS * (1 << attempt.min(6));
    let jitter = rand::random::<u64>() % (base / 4 + 1);
    (base + jitter).min(MAX_BACKOFF_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sync_state() {
        let db = Database::open_in_memory().unwrap();
        let state = SyncStateStorage::new(&db).load_sync_state().unwrap();
        assert_eq!(state.scanned_height, 0);
        assert_eq!(state.target_height, 0);
    }

    #[test]
    fn test_update_individual_fields() {
        let db = Database::open_in_memory().unwrap();
        let storage = SyncStateStorage::new(&db);

        storage.update_scanned_height(500).unwrap();
        storage.update_target_height(1000).unwrap();

        let state = storage.load_sync_state().unwrap();
        assert_eq!(state.scanned_height, 500);
        assert_eq!(state.target_height, 1000);
    }

    #[test]
    fn test_backoff_is_bounded() {
        for attempt in 1..20 {
            let backoff = calculate_backoff(attempt);
            assert!(backoff >= BASE_BACKOFF_MS.min(MAX_BACKOFF_MS));
            assert!(backoff <= MAX_BACKOFF_MS);
        }
    }
}
