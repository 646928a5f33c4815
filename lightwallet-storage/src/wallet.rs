//! Scanned blocks, wallet transactions and transparent UTXOs

use crate::sync_state::with_busy_retry;
use crate::{Database, Result, ScannedBlock, Utxo, WalletTransaction};
use rusqlite::{params, OptionalExtension};

/// Wallet tables written by the scan engine
pub struct WalletStorage<'a> {
    db: &'a Database,
}

impl<'a> WalletStorage<'a> {
    /// Create new wallet storage
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Record scanned blocks and the wallet transactions found in them atomically
    pub fn record_scanned(
        &self,
        blocks: &[ScannedBlock],
        transactions: &[WalletTransaction],
    ) -> Result<()> {
        self.db.with_transaction(|tx| {
            {
                let mut insert_block = tx.prepare_cached(
                    "INSERT OR REPLACE INTO scanned_blocks (height, hash, prev_hash, time, tx_count) VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for block in blocks {
                    insert_block.execute(params![
                        block.height,
                        block.hash,
                        block.prev_hash,
                        block.time,
                        block.tx_count
                    ])?;
                }

                let mut insert_tx = tx.prepare_cached(
                    "INSERT OR IGNORE INTO transactions (txid, height, tx_index, raw) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for wtx in transactions {
                    insert_tx.execute(params![wtx.txid, wtx.height, wtx.tx_index, wtx.raw])?;
                }
            }

            if let Some(top) = blocks.iter().map(|b| b.height).max() {
                tx.execute(
                    "UPDATE sync_state SET scanned_height = MAX(scanned_height, ?1), updated_at = ?2 WHERE id = 1",
                    params![top, chrono::Utc::now().to_rfc3339()],
                )?;
            }
            Ok(())
        })
    }

    /// Highest scanned block, if any
    pub fn last_scanned_block(&self) -> Result<Option<ScannedBlock>> {
        with_busy_retry(|| {
            let row = self
                .db
                .conn()
                .query_row(
                    "SELECT height, hash, prev_hash, time, tx_count FROM scanned_blocks ORDER BY height DESC LIMIT 1",
                    [],
                    map_block,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Scanned block at `height`, if any
    pub fn scanned_block(&self, height: u64) -> Result<Option<ScannedBlock>> {
        with_busy_retry(|| {
            let row = self
                .db
                .conn()
                .query_row(
                    "SELECT height, hash, prev_hash, time, tx_count FROM scanned_blocks WHERE height = ?1",
                    [height],
                    map_block,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Highest scanned height at or below `height`
    pub fn scanned_height_at_or_below(&self, height: u64) -> Result<Option<u64>> {
        with_busy_retry(|| {
            let row: Option<u64> = self.db.conn().query_row(
                "SELECT MAX(height) FROM scanned_blocks WHERE height <= ?1",
                [height],
                |row| row.get(0),
            )?;
            Ok(row)
        })
    }

    /// Wallet transactions mined in `[lower, upper]` that have no raw bytes yet
    pub fn transactions_to_enhance(&self, lower: u64, upper: u64) -> Result<Vec<WalletTransaction>> {
        with_busy_retry(|| {
            let conn = self.db.conn();
            let mut stmt = conn.prepare_cached(
                "SELECT txid, height, tx_index, raw FROM transactions WHERE raw IS NULL AND height BETWEEN ?1 AND ?2 ORDER BY height, tx_index",
            )?;
            let rows = stmt
                .query_map([lower, upper], map_transaction)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Look up a wallet transaction by id
    pub fn transaction(&self, txid: &[u8]) -> Result<Option<WalletTransaction>> {
        with_busy_retry(|| {
            let row = self
                .db
                .conn()
                .query_row(
                    "SELECT txid, height, tx_index, raw FROM transactions WHERE txid = ?1",
                    [txid],
                    map_transaction,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Attach raw bytes to a wallet transaction, inserting it if unknown
    pub fn store_raw_transaction(&self, txid: &[u8], height: u64, raw: &[u8]) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        with_busy_retry(|| {
            self.db.conn().execute(
                r#"
                INSERT INTO transactions (txid, height, tx_index, raw, enhanced_at)
                VALUES (?1, ?2, 0, ?3, ?4)
                ON CONFLICT(txid) DO UPDATE SET raw = excluded.raw, enhanced_at = excluded.enhanced_at
                "#,
                params![txid, height, raw, now],
            )?;
            Ok(())
        })
    }

    /// Replace the UTXO set for `addresses` with `utxos`
    pub fn replace_utxos(&self, addresses: &[String], utxos: &[Utxo]) -> Result<()> {
        self.db.with_transaction(|tx| {
            for address in addresses {
                tx.execute("DELETE FROM utxos WHERE address = ?1", [address])?;
            }
            let mut insert = tx.prepare_cached(
                "INSERT OR REPLACE INTO utxos (txid, output_index, address, script, value_zat, height) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for utxo in utxos {
                insert.execute(params![
                    utxo.txid,
                    utxo.output_index,
                    utxo.address,
                    utxo.script,
                    utxo.value_zat,
                    utxo.height
                ])?;
            }
            Ok(())
        })
    }

    /// All stored UTXOs
    pub fn utxos(&self) -> Result<Vec<Utxo>> {
        with_busy_retry(|| {
            let conn = self.db.conn();
            let mut stmt = conn.prepare_cached(
                "SELECT txid, output_index, address, script, value_zat, height FROM utxos ORDER BY height, txid, output_index",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(Utxo {
                        txid: row.get(0)?,
                        output_index: row.get(1)?,
                        address: row.get(2)?,
                        script: row.get(3)?,
                        value_zat: row.get(4)?,
                        height: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Truncate data above a specific height (for rollback)
    pub fn truncate_above_height(&self, height: u64) -> Result<()> {
        self.db.with_transaction(|tx| {
            tx.execute("DELETE FROM scanned_blocks WHERE height > ?1", [height])?;
            tx.execute("DELETE FROM transactions WHERE height > ?1", [height])?;
            tx.execute("DELETE FROM utxos WHERE height > ?1", [height])?;
            tx.execute(
                r#"
                UPDATE sync_state SET
                    scanned_height = MIN(scanned_height, ?1),
                    last_rewind_height = ?1,
                    updated_at = ?2
                WHERE id = 1
                "#,
                params![height, chrono::Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })?;

        tracing::info!("Truncated wallet data above height {}", height);
        Ok(())
    }

    /// Delete all scan results, transactions and UTXOs
    pub fn wipe(&self) -> Result<()> {
        self.db.with_transaction(|tx| {
            tx.execute_batch(
                r#"
                DELETE FROM scanned_blocks;
                DELETE FROM transactions;
                DELETE FROM utxos;
                DELETE FROM accounts;
                UPDATE sync_state SET scanned_height = 0, target_height = 0, last_rewind_height = 0;
                "#,
            )?;
            Ok(())
        })
    }
}

fn map_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScannedBlock> {
    Ok(ScannedBlock {
        height: row.get(0)?,
        hash: row.get(1)?,
        prev_hash: row.get(2)?,
        time: row.get(3)?,
        tx_count: row.get(4)?,
    })
}

fn map_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<WalletTransaction> {
    Ok(WalletTransaction {
        txid: row.get(0)?,
        height: row.get(1)?,
        tx_index: row.get(2)?,
        raw: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncStateStorage;

    fn block(height: u64) -> ScannedBlock {
        ScannedBlock {
            height,
            hash: vec![height as u8],
            prev_hash: vec![(height - 1) as u8],
            time: 0,
            tx_count: 1,
        }
    }

    fn wtx(id: u8, height: u64) -> WalletTransaction {
        WalletTransaction {
            txid: vec![id; 32],
            height,
            tx_index: 0,
            raw: None,
        }
    }

    #[test]
    fn test_record_and_query_scanned() {
        let db = Database::open_in_memory().unwrap();
        let storage = WalletStorage::new(&db);
        let blocks: Vec<_> = (100..=105).map(block).collect();
        storage.record_scanned(&blocks, &[wtx(1, 102)]).unwrap();

        assert_eq!(storage.last_scanned_block().unwrap().unwrap().height, 105);
        assert_eq!(storage.scanned_block(103).unwrap(), Some(block(103)));
        assert_eq!(storage.scanned_height_at_or_below(99).unwrap(), None);
        assert_eq!(storage.scanned_height_at_or_below(104).unwrap(), Some(104));
        assert_eq!(
            SyncStateStorage::new(&db).load_sync_state().unwrap().scanned_height,
            105
        );
    }

    #[test]
    fn test_heights_round_trip_as_unsigned() {
        let db = Database::open_in_memory().unwrap();
        let storage = WalletStorage::new(&db);
        let high = u32::MAX as u64 + 10;
        storage
            .record_scanned(&[block(high), block(high + 1)], &[wtx(7, high + 1)])
            .unwrap();

        assert_eq!(storage.last_scanned_block().unwrap().unwrap().height, high + 1);
        assert_eq!(storage.scanned_height_at_or_below(high).unwrap(), Some(high));
        let pending = storage.transactions_to_enhance(high, high + 1).unwrap();
        assert_eq!(pending, vec![wtx(7, high + 1)]);
        storage.truncate_above_height(high).unwrap();
        assert_eq!(
            SyncStateStorage::new(&db).load_sync_state().unwrap().scanned_height,
            high
        );
    }

    #[test]
    fn test_enhancement_queue() {
        let db = Database::open_in_memory().unwrap();
        let storage = WalletStorage::new(&db);
        storage
            .record_scanned(&[block(10), block(11)], &[wtx(1, 10), wtx(2, 11)])
            .unwrap();

        assert_eq!(storage.transactions_to_enhance(0, 100).unwrap().len(), 2);
        storage.store_raw_transaction(&[1; 32], 10, b"raw").unwrap();

        let pending = storage.transactions_to_enhance(0, 100).unwrap();
        assert_eq!(pending, vec![wtx(2, 11)]);
        assert!(storage.transaction(&[1; 32]).unwrap().unwrap().is_enhanced());
    }

    #[test]
    fn test_truncate_above_height() {
        let db = Database::open_in_memory().unwrap();
        let storage = WalletStorage::new(&db);
        let blocks: Vec<_> = (1000..=1010).map(block).collect();
        storage
            .record_scanned(&blocks, &[wtx(1, 1001), wtx(2, 1008)])
            .unwrap();
        storage
            .replace_utxos(
                &["t1addr".to_string()],
                &[Utxo {
                    txid: vec![9; 32],
                    output_index: 0,
                    address: "t1addr".to_string(),
                    script: vec![],
                    value_zat: 5,
                    height: 1009,
                }],
            )
            .unwrap();

        storage.truncate_above_height(1005).unwrap();

        assert_eq!(storage.last_scanned_block().unwrap().unwrap().height, 1005);
        assert!(storage.transaction(&[2; 32]).unwrap().is_none());
        assert!(storage.transaction(&[1; 32]).unwrap().is_some());
        assert!(storage.utxos().unwrap().is_empty());
        let state = SyncStateStorage::new(&db).load_sync_state().unwrap();
        assert_eq!(state.scanned_height, 1005);
        assert_eq!(state.last_rewind_height, 1005);
    }

    #[test]
    fn test_replace_utxos_only_touches_given_addresses() {
        let db = Database::open_in_memory().unwrap();
        let storage = WalletStorage::new(&db);
        let utxo = |addr: &str, id: u8| Utxo {
            txid: vec![id; 32],
            output_index: 0,
            address: addr.to_string(),
            script: vec![0x76],
            value_zat: 1,
            height: 1,
        };
        storage
            .replace_utxos(&["a".into(), "b".into()], &[utxo("a", 1), utxo("b", 2)])
            .unwrap();
        storage.replace_utxos(&["a".into()], &[utxo("a", 3)]).unwrap();

        let all = storage.utxos().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|u| u.txid == vec![3; 32]));
        assert!(all.iter().any(|u| u.txid == vec![2; 32]));
    }

    #[test]
    fn test_wipe() {
        let db = Database::open_in_memory().unwrap();
        let storage = WalletStorage::new(&db);
        storage.record_scanned(&[block(5)], &[wtx(1, 5)]).unwrap();
        storage.wipe().unwrap();
        assert!(storage.last_scanned_block().unwrap().is_none());
        assert!(storage.transaction(&[1; 32]).unwrap().is_none());
    }
}
