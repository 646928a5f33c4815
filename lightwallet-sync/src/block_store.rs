//! Local compact block cache.
//!
//! Blocks are kept in a single SQLite table keyed by height. Stored heights
//! always form one contiguous run: writes must continue at the next height
//! and rewinds only ever trim the top.

use crate::types::{BlockHeight, BlockRange, CompactBlock};
use crate::{Error, Result};
use directories::ProjectDirs;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Environment variable overriding the block cache directory
pub const BLOCK_CACHE_DIR_ENV: &str = "LIGHTWALLET_BLOCK_CACHE_DIR";

/// Compact block store. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct BlockStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl BlockStore {
    /// Open the per-endpoint cache under the default cache directory
    pub fn for_endpoint(endpoint: &str) -> Result<Self> {
        let path = cache_path_for_endpoint(endpoint)?;
        Self::open(path)
    }

    /// Open (or create) a store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::Storage(e.to_string()))?;
            }
        }
        let conn = Connection::open(&path).map_err(storage_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(storage_err)?;
        Self::init(conn, Some(path))
    }

    /// In-memory store (tests, dry runs)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS compactblocks (
                height INTEGER PRIMARY KEY,
                data BLOB NOT NULL
             );",
        )
        .map_err(storage_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// On-disk location, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append blocks. The first block must be the next contiguous height
    /// (any height when the store is empty) and the rest must follow it;
    /// otherwise nothing is written and `UnexpectedHeight` is returned.
    pub fn write(&self, blocks: &[CompactBlock]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let latest = latest_height_locked(&conn)?;
        let mut expected = latest.map(|h| h + 1).unwrap_or(blocks[0].height);

        let tx = conn.transaction().map_err(storage_err)?;
        {
            let mut stmt = tx
                .prepare_cached("INSERT INTO compactblocks (height, data) VALUES (?1, ?2)")
                .map_err(storage_err)?;
            for block in blocks {
                if block.height != expected {
                    return Err(Error::UnexpectedHeight {
                        expected,
                        actual: block.height,
                    });
                }
                let encoded = encode_block(block)?;
                stmt.execute(params![block.height, encoded])
                    .map_err(storage_err)?;
                expected += 1;
            }
        }
        tx.commit().map_err(storage_err)?;
        Ok(())
    }

    /// Highest stored height, `None` when empty
    pub fn latest_height(&self) -> Result<Option<BlockHeight>> {
        latest_height_locked(&self.conn.lock())
    }

    /// Highest stored height, 0 when empty
    pub fn highest_height(&self) -> Result<BlockHeight> {
        Ok(self.latest_height()?.unwrap_or(0))
    }

    /// Lowest stored height, `None` when empty
    pub fn lowest_height(&self) -> Result<Option<BlockHeight>> {
        self.conn
            .lock()
            .query_row("SELECT MIN(height) FROM compactblocks", [], |row| row.get(0))
            .map_err(storage_err)
    }

    /// Delete every block above `height`
    pub fn rewind(&self, height: BlockHeight) -> Result<()> {
        let conn = self.conn.lock();
        let latest = latest_height_locked(&conn)?.unwrap_or(0);
        if height > latest {
            return Err(Error::RewindTargetAboveLatest {
                target: height,
                latest,
            });
        }
        let removed = conn
            .execute("DELETE FROM compactblocks WHERE height > ?1", [height])
            .map_err(storage_err)?;
        tracing::debug!("Block store rewound to {} ({} blocks removed)", height, removed);
        Ok(())
    }

    /// Delete all blocks
    pub fn clear(&self) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM compactblocks", [])
            .map_err(storage_err)?;
        tracing::debug!("Block store cleared");
        Ok(())
    }

    /// Stored blocks inside `range`, ascending
    pub fn load_range(&self, range: BlockRange) -> Result<Vec<CompactBlock>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT data FROM compactblocks WHERE height BETWEEN ?1 AND ?2 ORDER BY height ASC",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![range.lower(), range.upper()], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .map_err(storage_err)?;

        let mut blocks = Vec::with_capacity(range.len() as usize);
        for row in rows {
            blocks.push(decode_block(&row.map_err(storage_err)?)?);
        }
        Ok(blocks)
    }

    /// Single stored block
    pub fn block(&self, height: BlockHeight) -> Result<Option<CompactBlock>> {
        let data: Option<Vec<u8>> = self
            .conn
            .lock()
            .query_row(
                "SELECT data FROM compactblocks WHERE height = ?1",
                [height],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        data.map(|bytes| decode_block(&bytes)).transpose()
    }
}

fn latest_height_locked(conn: &Connection) -> Result<Option<BlockHeight>> {
    conn.query_row("SELECT MAX(height) FROM compactblocks", [], |row| row.get(0))
        .map_err(storage_err)
}

fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

fn cache_base_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(BLOCK_CACHE_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    ProjectDirs::from("io", "Lightwallet", "LightwalletSync")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Default cache file for an endpoint; distinct endpoints never share a cache
pub fn cache_path_for_endpoint(endpoint: &str) -> Result<PathBuf> {
    let hash = Sha256::digest(endpoint.trim_end_matches('/').as_bytes());
    let short = hex::encode(&hash[..8]);
    Ok(cache_base_dir().join(format!("compact_blocks_{}.db", short)))
}

fn encode_block(block: &CompactBlock) -> Result<Vec<u8>> {
    serde_json::to_vec(block).map_err(|e| Error::Storage(e.to_string()))
}

fn decode_block(bytes: &[u8]) -> Result<CompactBlock> {
    serde_json::from_slice(bytes).map_err(|e| Error::Storage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn blocks(from: BlockHeight, to: BlockHeight) -> Vec<CompactBlock> {
        (from..=to)
            .map(|h| CompactBlock::empty(h, h.to_le_bytes().to_vec(), (h - 1).to_le_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_write_and_load() {
        let store = BlockStore::open_in_memory().unwrap();
        assert_eq!(store.latest_height().unwrap(), None);
        assert_eq!(store.highest_height().unwrap(), 0);

        store.write(&blocks(1000, 1004)).unwrap();
        store.write(&blocks(1005, 1010)).unwrap();

        assert_eq!(store.latest_height().unwrap(), Some(1010));
        assert_eq!(store.lowest_height().unwrap(), Some(1000));
        let loaded = store.load_range(BlockRange::new(1003, 1006).unwrap()).unwrap();
        assert_eq!(
            loaded.iter().map(|b| b.height).collect::<Vec<_>>(),
            vec![1003, 1004, 1005, 1006]
        );
        assert_eq!(store.block(1007).unwrap().unwrap().height, 1007);
        assert!(store.block(2000).unwrap().is_none());
    }

    #[test]
    fn test_gap_rejected_atomically() {
        let store = BlockStore::open_in_memory().unwrap();
        store.write(&blocks(10, 12)).unwrap();

        let err = store.write(&blocks(14, 15)).unwrap_err();
        assert!(matches!(err, Error::UnexpectedHeight { expected: 13, actual: 14 }));

        let mut broken = blocks(13, 16);
        broken.remove(2);
        let err = store.write(&broken).unwrap_err();
        assert!(matches!(err, Error::UnexpectedHeight { expected: 15, actual: 16 }));
        assert_eq!(store.latest_height().unwrap(), Some(12));
    }

    #[test]
    fn test_duplicate_rejected() {
        let store = BlockStore::open_in_memory().unwrap();
        store.write(&blocks(10, 12)).unwrap();
        assert!(matches!(
            store.write(&blocks(12, 12)),
            Err(Error::UnexpectedHeight { expected: 13, actual: 12 })
        ));
    }

    #[test]
    fn test_rewind() {
        let store = BlockStore::open_in_memory().unwrap();
        store.write(&blocks(1000, 1010)).unwrap();

        store.rewind(1010).unwrap();
        assert_eq!(store.highest_height().unwrap(), 1010);

        store.rewind(1005).unwrap();
        assert_eq!(store.highest_height().unwrap(), 1005);

        assert!(matches!(
            store.rewind(1006),
            Err(Error::RewindTargetAboveLatest { target: 1006, latest: 1005 })
        ));

        // below the lowest block empties the store
        store.rewind(995).unwrap();
        assert_eq!(store.latest_height().unwrap(), None);
        store.write(&blocks(996, 997)).unwrap();
        assert_eq!(store.highest_height().unwrap(), 997);
    }

    #[test]
    fn test_clear() {
        let store = BlockStore::open_in_memory().unwrap();
        store.write(&blocks(1, 3)).unwrap();
        store.clear().unwrap();
        assert_eq!(store.latest_height().unwrap(), None);
        store.write(&blocks(50, 51)).unwrap();
        assert_eq!(store.lowest_height().unwrap(), Some(50));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache").join("blocks.db");
        BlockStore::open(&path).unwrap().write(&blocks(7, 9)).unwrap();
        let store = BlockStore::open(&path).unwrap();
        assert_eq!(store.latest_height().unwrap(), Some(9));
        assert_eq!(store.path(), Some(path.as_path()));
    }

    #[test]
    fn test_cache_path_per_endpoint() {
        let a = cache_path_for_endpoint("https://lightwalletd.example:9067").unwrap();
        let b = cache_path_for_endpoint("https://lightwalletd.example:9067/").unwrap();
        let c = cache_path_for_endpoint("https://other.example:9067").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("compact_blocks_"));
    }
}
