//! Append-only price history storage.
//!
//! The persistence collaborator of the pipeline: every persisted broadcast
//! snapshot and baseline recomputation lands in one table, newest-first
//! reads for the history endpoint.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::info;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS price_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts INTEGER NOT NULL,
    source TEXT NOT NULL,
    price REAL NOT NULL,
    confidence REAL NOT NULL,
    tx_count INTEGER NOT NULL,
    block_height INTEGER
);

CREATE INDEX IF NOT EXISTS idx_snapshots_ts ON price_snapshots(ts DESC);
CREATE INDEX IF NOT EXISTS idx_snapshots_source ON price_snapshots(source, ts DESC);
"#;

/// One appended price observation.
#[derive(Debug, Clone, Serialize)]
pub struct PriceSnapshot {
    pub ts: i64,
    /// "mempool" or "baseline".
    pub source: String,
    pub price: f64,
    pub confidence: f64,
    pub tx_count: u64,
    pub block_height: Option<u64>,
}

pub struct PriceHistoryStore {
    conn: Mutex<Connection>,
}

impl PriceHistoryStore {
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open price history db at {}", path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to apply price history schema")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        info!(path, rows = store.len(), "Price history store ready");
        Ok(store)
    }

    pub fn append(&self, snapshot: &PriceSnapshot) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO price_snapshots (ts, source, price, confidence, tx_count, block_height)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                snapshot.ts,
                snapshot.source,
                snapshot.price,
                snapshot.confidence,
                snapshot.tx_count as i64,
                snapshot.block_height.map(|h| h as i64),
            ],
        )
        .context("Failed to append price snapshot")?;
        Ok(())
    }

    /// Most recent snapshots, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<PriceSnapshot>> {
        let conn = self.conn.lock();
        let mut statement = conn
            .prepare(
                "SELECT ts, source, price, confidence, tx_count, block_height
                 FROM price_snapshots ORDER BY ts DESC, id DESC LIMIT ?1",
            )
            .context("Failed to prepare history query")?;

        let rows = statement
            .query_map(params![limit as i64], |row| {
                Ok(PriceSnapshot {
                    ts: row.get(0)?,
                    source: row.get(1)?,
                    price: row.get(2)?,
                    confidence: row.get(3)?,
                    tx_count: row.get::<_, i64>(4)? as u64,
                    block_height: row.get::<_, Option<i64>>(5)?.map(|h| h as u64),
                })
            })
            .context("Failed to query price history")?;

        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row.context("Bad price history row")?);
        }
        Ok(snapshots)
    }

    pub fn len(&self) -> usize {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM price_snapshots", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(ts: i64, source: &str, price: f64) -> PriceSnapshot {
        PriceSnapshot {
            ts,
            source: source.to_string(),
            price,
            confidence: 0.8,
            tx_count: 42,
            block_height: Some(850_000),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let store = PriceHistoryStore::new(path.to_str().unwrap()).unwrap();

        assert!(store.is_empty());
        store.append(&snapshot(100, "mempool", 99_000.0)).unwrap();
        store.append(&snapshot(200, "baseline", 98_500.0)).unwrap();
        store.append(&snapshot(300, "mempool", 99_200.0)).unwrap();

        assert_eq!(store.len(), 3);
        let recent = store.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].ts, 300);
        assert_eq!(recent[1].source, "baseline");
        assert_eq!(recent[1].block_height, Some(850_000));
    }

    #[test]
    fn test_reopen_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        {
            let store = PriceHistoryStore::new(path.to_str().unwrap()).unwrap();
            store.append(&snapshot(1, "mempool", 100_000.0)).unwrap();
        }
        let store = PriceHistoryStore::new(path.to_str().unwrap()).unwrap();
        assert_eq!(store.len(), 1);
    }
}
