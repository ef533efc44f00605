//! SQLite-backed history (the default store).
//!
//! Each append runs in a `BEGIN IMMEDIATE` transaction that inserts and then
//! trims, so writers are serialized across processes and readers only ever
//! see committed, trimmed state.

use rusqlite::{params, TransactionBehavior};
use serde::de::DeserializeOwned;

use super::{History, HistoryError, HistoryStore, RELEASE_HISTORY_CAP, RUN_HISTORY_CAP};
use crate::pipeline::{ReleaseRecord, RunRecord};
use crate::storage::{self, Pool};

#[derive(Clone)]
pub struct SqliteHistory {
    pool: Pool,
}

impl SqliteHistory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, HistoryError> {
        Ok(Self::new(storage::open_pool(path)?))
    }

    pub fn get_pool(&self) -> &Pool {
        &self.pool
    }

    fn load_table<T: DeserializeOwned>(
        conn: &rusqlite::Connection,
        table: &str,
    ) -> Result<Vec<T>, HistoryError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT seq, payload_json FROM {} ORDER BY seq ASC",
            table
        ))?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;

        let mut out = Vec::new();
        for r in rows {
            let (seq, json) = r?;
            let record = serde_json::from_str(&json).map_err(|source| HistoryError::Corrupt {
                location: format!("{} row {}", table, seq),
                source,
            })?;
            out.push(record);
        }
        Ok(out)
    }
}

impl HistoryStore for SqliteHistory {
    fn load(&self) -> Result<History, HistoryError> {
        let mut conn = self.pool.get()?;
        // One read transaction so both sequences come from the same snapshot.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let runs = Self::load_table(&tx, "pipeline_runs")?;
        let releases = Self::load_table(&tx, "releases")?;
        tx.commit()?;
        Ok(History { runs, releases })
    }

    fn append_run(&self, record: &RunRecord) -> Result<(), HistoryError> {
        let payload = serde_json::to_string(record).map_err(HistoryError::Serialize)?;
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO pipeline_runs (run_id, status, payload_json) VALUES (?1, ?2, ?3)",
            params![record.run_id.to_string(), record.status.to_string(), payload],
        )?;
        let evicted = tx.execute(
            "DELETE FROM pipeline_runs WHERE seq NOT IN
                (SELECT seq FROM pipeline_runs ORDER BY seq DESC LIMIT ?1)",
            params![RUN_HISTORY_CAP as i64],
        )?;

        tx.commit()?;
        tracing::debug!(run_id = %record.run_id, evicted, "run record stored");
        Ok(())
    }

    fn append_release(&self, record: &ReleaseRecord) -> Result<(), HistoryError> {
        let payload = serde_json::to_string(record).map_err(HistoryError::Serialize)?;
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO releases (release_id, run_id, payload_json) VALUES (?1, ?2, ?3)",
            params![record.release_id, record.run_id.to_string(), payload],
        )?;
        let evicted = tx.execute(
            "DELETE FROM releases WHERE seq NOT IN
                (SELECT seq FROM releases ORDER BY seq DESC LIMIT ?1)",
            params![RELEASE_HISTORY_CAP as i64],
        )?;

        tx.commit()?;
        tracing::debug!(release_id = %record.release_id, evicted, "release record stored");
        Ok(())
    }
}
