//! SQLite storage for simulation results.
//!
//! Uses WAL mode and prepared statements inside batch transactions so long
//! chains insert quickly. One `runs` row per invocation; block, transaction,
//! and bid-snapshot rows hang off it and the analyze path reads them back.

use std::cell::RefCell;

use eyre::Result;
use rusqlite::Connection;
use serde::Serialize;

/// `(block_number, proposer_id, builder_id, bid, block_value, reward)`
pub type BlockRow = (u64, u32, u32, f64, f64, f64);

/// `(block_number, tx_index, tx_id, gas, mev)`
pub type TxRow = (u64, u64, i64, f64, f64);

/// `(block_number, builder_id, bid, block_value)`
pub type BidRow = (u64, u32, f64, f64);

/// A block row read back for analysis.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StoredBlock {
    pub block_number: u64,
    pub proposer_id: u32,
    pub builder_id: u32,
    pub bid: f64,
    pub block_value: f64,
    pub reward: f64,
}

/// Run metadata for the status listing.
#[derive(Clone, Debug, PartialEq)]
pub struct RunMeta {
    pub id: i64,
    pub started_at: String,
    pub seed: u64,
    pub chain_length: u64,
    pub mode: String,
    pub block_count: u64,
}

pub struct Store {
    conn: RefCell<Connection>,
}

impl Store {
    /// Creates or opens the database with WAL mode enabled.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrations fail.
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: RefCell::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.borrow_mut().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at TEXT,
                seed INTEGER,
                chain_length INTEGER,
                mode TEXT
            );

            CREATE TABLE IF NOT EXISTS blocks (
                run_id INTEGER,
                chain TEXT,
                block_number INTEGER,
                proposer_id INTEGER,
                builder_id INTEGER,
                bid REAL,
                block_value REAL,
                reward REAL,
                PRIMARY KEY (run_id, chain, block_number)
            );

            CREATE TABLE IF NOT EXISTS block_transactions (
                run_id INTEGER,
                chain TEXT,
                block_number INTEGER,
                tx_index INTEGER,
                tx_id INTEGER,
                gas REAL,
                mev REAL,
                PRIMARY KEY (run_id, chain, block_number, tx_index)
            );

            CREATE TABLE IF NOT EXISTS auction_bids (
                run_id INTEGER,
                block_number INTEGER,
                builder_id INTEGER,
                bid REAL,
                block_value REAL,
                PRIMARY KEY (run_id, block_number, builder_id)
            );
            ",
        )?;
        Ok(())
    }

    /// Registers a new run and returns its id.
    pub fn begin_run(&self, seed: u64, chain_length: u64, mode: &str) -> Result<i64> {
        let started_at = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.borrow_mut();
        conn.execute(
            "INSERT INTO runs (started_at, seed, chain_length, mode) VALUES (?, ?, ?, ?)",
            rusqlite::params![started_at, seed as i64, chain_length as i64, mode],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Batch insert finalised block rows for one chain of a run.
    ///
    /// # Errors
    /// Returns error if database insert fails.
    pub fn insert_blocks(&self, run_id: i64, chain: &str, rows: &[BlockRow]) -> Result<usize> {
        let mut conn = self.conn.borrow_mut();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT OR REPLACE INTO blocks (
                    run_id, chain, block_number, proposer_id, builder_id,
                    bid, block_value, reward
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )?;
            for (block_number, proposer_id, builder_id, bid, block_value, reward) in rows {
                stmt.execute(rusqlite::params![
                    run_id,
                    chain,
                    *block_number as i64,
                    *proposer_id as i64,
                    *builder_id as i64,
                    bid,
                    block_value,
                    reward,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Batch insert per-transaction rows for one chain of a run.
    pub fn insert_block_transactions(
        &self,
        run_id: i64,
        chain: &str,
        rows: &[TxRow],
    ) -> Result<usize> {
        let mut conn = self.conn.borrow_mut();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT OR REPLACE INTO block_transactions (
                    run_id, chain, block_number, tx_index, tx_id, gas, mev
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ",
            )?;
            for (block_number, tx_index, tx_id, gas, mev) in rows {
                stmt.execute(rusqlite::params![
                    run_id,
                    chain,
                    *block_number as i64,
                    *tx_index as i64,
                    tx_id,
                    gas,
                    mev,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Batch insert the per-auction bid snapshots of a run's PBS chain.
    pub fn insert_auction_bids(&self, run_id: i64, rows: &[BidRow]) -> Result<usize> {
        let mut conn = self.conn.borrow_mut();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT OR REPLACE INTO auction_bids (
                    run_id, block_number, builder_id, bid, block_value
                ) VALUES (?, ?, ?, ?, ?)
                ",
            )?;
            for (block_number, builder_id, bid, block_value) in rows {
                stmt.execute(rusqlite::params![
                    run_id,
                    *block_number as i64,
                    *builder_id as i64,
                    bid,
                    block_value,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Reads one chain's block rows back, ordered by block number.
    pub fn get_blocks(&self, run_id: i64, chain: &str) -> Result<Vec<StoredBlock>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare(
            "
            SELECT block_number, proposer_id, builder_id, bid, block_value, reward
            FROM blocks WHERE run_id = ? AND chain = ?
            ORDER BY block_number
            ",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![run_id, chain], |row| {
                Ok(StoredBlock {
                    block_number: row.get::<_, i64>(0)? as u64,
                    proposer_id: row.get::<_, i64>(1)? as u32,
                    builder_id: row.get::<_, i64>(2)? as u32,
                    bid: row.get(3)?,
                    block_value: row.get(4)?,
                    reward: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Most recent run id, if any runs exist.
    pub fn latest_run_id(&self) -> Result<Option<i64>> {
        let conn = self.conn.borrow();
        let id = conn
            .query_row("SELECT MAX(id) FROM runs", [], |row| {
                row.get::<_, Option<i64>>(0)
            })?;
        Ok(id)
    }

    /// Run listing with per-run PBS block counts, newest first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunMeta>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare(
            "
            SELECT r.id, r.started_at, r.seed, r.chain_length, r.mode,
                   (SELECT COUNT(*) FROM blocks b
                    WHERE b.run_id = r.id AND b.chain = 'pbs')
            FROM runs r
            ORDER BY r.id DESC
            LIMIT ?
            ",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(RunMeta {
                    id: row.get(0)?,
                    started_at: row.get(1)?,
                    seed: row.get::<_, i64>(2)? as u64,
                    chain_length: row.get::<_, i64>(3)? as u64,
                    mode: row.get(4)?,
                    block_count: row.get::<_, i64>(5)? as u64,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
