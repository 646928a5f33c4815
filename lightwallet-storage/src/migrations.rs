//! Database schema migrations

use crate::{Error, Result};
use rusqlite::Connection;

const SCHEMA_VERSION: i32 = 2;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    tracing::debug!(
        "Running migrations: current_version={}, target_version={}",
        current_version,
        SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    if current_version != SCHEMA_VERSION {
        set_schema_version(conn, SCHEMA_VERSION)?;
    }

    Ok(())
}

/// Current schema version, 0 for a fresh database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    let result = conn.query_row(
        "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
        [],
        |row| row.get(0),
    );

    match result {
        Ok(v) => Ok(v),
        Err(_) => Ok(0),
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    tracing::debug!("Schema version set to {}", version);
    Ok(())
}

/// Accounts, scanned block headers and the sync watermark row
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE accounts (
            account_index INTEGER PRIMARY KEY,
            viewing_key TEXT NOT NULL,
            birthday_height INTEGER NOT NULL,
            name TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE scanned_blocks (
            height INTEGER PRIMARY KEY,
            hash BLOB NOT NULL,
            prev_hash BLOB NOT NULL,
            time INTEGER NOT NULL,
            tx_count INTEGER NOT NULL
        );

        CREATE TABLE sync_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            scanned_height INTEGER NOT NULL DEFAULT 0,
            target_height INTEGER NOT NULL DEFAULT 0,
            last_rewind_height INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );

        INSERT INTO sync_state (id, updated_at) VALUES (1, datetime('now'));
        "#,
    )
    .map_err(|e| Error::Migration(e.to_string()))?;

    Ok(())
}

/// Wallet transactions (enhancement queue) and transparent UTXOs
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE transactions (
            txid BLOB PRIMARY KEY,
            height INTEGER NOT NULL,
            tx_index INTEGER NOT NULL,
            raw BLOB,
            enhanced_at TEXT
        );

        CREATE TABLE utxos (
            txid BLOB NOT NULL,
            output_index INTEGER NOT NULL,
            address TEXT NOT NULL,
            script BLOB NOT NULL,
            value_zat INTEGER NOT NULL,
            height INTEGER NOT NULL,
            PRIMARY KEY (txid, output_index)
        );

        CREATE INDEX idx_transactions_height ON transactions(height);
        CREATE INDEX idx_utxos_address ON utxos(address);
        "#,
    )
    .map_err(|e| Error::Migration(e.to_string()))?;

    Ok(())
}
