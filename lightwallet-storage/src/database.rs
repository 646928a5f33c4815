//! Database connection and initialization

use crate::{migrations, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags, Transaction};
use std::path::{Path, PathBuf};

/// Database connection wrapper
///
/// The connection sits behind a mutex so a single `Database` can be shared
/// (via `Arc`) between the sync pipeline and readers on other tasks.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the wallet database at `path` and run migrations
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        if let Some(parent) = path_buf.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| crate::Error::Storage(format!("create {:?}: {}", parent, e)))?;
            }
        }

        let conn = Connection::open_with_flags(
            &path_buf,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(std::time::Duration::from_millis(250))?;

        migrations::run_migrations(&conn)?;
        tracing::debug!("Opened wallet database at {:?}", path_buf);

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path_buf),
        })
    }

    /// Open a private in-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Get connection
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// On-disk location, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` inside a transaction, committing on success
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("wallet.db");
        let db = Database::open(&path).unwrap();
        assert_eq!(db.path(), Some(path.as_path()));
        assert!(path.exists());
    }

    #[test]
    fn test_reopen_keeps_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wallet.db");
        {
            let db = Database::open(&path).unwrap();
            db.conn()
                .execute(
                    "INSERT INTO scanned_blocks (height, hash, prev_hash, time, tx_count) VALUES (1, x'01', x'00', 0, 0)",
                    [],
                )
                .unwrap();
        }
        let db = Database::open(&path).unwrap();
        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM scanned_blocks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let insert = "INSERT INTO scanned_blocks (height, hash, prev_hash, time, tx_count) VALUES (5, x'05', x'04', 0, 0)";
        let result: Result<()> = db.with_transaction(|tx| {
            tx.execute(insert, [])?;
            // duplicate primary key
            tx.execute(insert, [])?;
            Ok(())
        });
        assert!(matches!(result, Err(crate::Error::Database(_))));
        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM scanned_blocks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
