//! SQLite implementation of the checkpoint store and output log.
//!
//! SQLite is the only durable store. A checkpoint write and the outputs it
//! produced share one transaction, so the relay never publishes an output
//! whose checkpoint was lost, and a checkpoint never commits without its
//! outputs.

use chrono::{DateTime, Utc};
use flow_types::{FlowId, OutputRecord};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::checkpoint::FlowCheckpoint;
use crate::error::{StoreError, StoreResult};
use crate::store::{CheckpointStore, LoggedOutput, OutputLog};

/// Checkpoint store backed by a single SQLite connection.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
    #[cfg(test)]
    pub(crate) fail_before_outputs: std::sync::atomic::AtomicBool,
}

impl SqliteCheckpointStore {
    /// Opens a SQLite database at the given path.
    ///
    /// Creates the database and schema if they don't exist.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
        ",
        )?;
        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "Opened checkpoint store");
        Ok(store)
    }

    /// Creates an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            #[cfg(test)]
            fail_before_outputs: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Number of output records still in the log.
    pub fn output_count(&self) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM output_log", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn stored_version(tx: &Transaction<'_>, flow_id: &FlowId) -> StoreResult<Option<u64>> {
        let version: Option<i64> = tx
            .query_row(
                "SELECT version FROM checkpoints WHERE flow_id = ?",
                params![flow_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.map(|v| v as u64))
    }

    fn terminated(conn: &Connection, flow_id: &FlowId) -> StoreResult<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM terminated_flows WHERE flow_id = ?",
                params![flow_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn append_outputs(tx: &Transaction<'_>, flow_id: &FlowId, outputs: &[OutputRecord], now: i64) -> StoreResult<()> {
        let mut stmt = tx.prepare(
            "INSERT INTO output_log (flow_id, topic, record_key, record, created_at) VALUES (?, ?, ?, ?, ?)",
        )?;
        for output in outputs {
            let record = serde_json::to_string(output)?;
            stmt.execute(params![flow_id.as_str(), output.topic(), output.key(), record, now])?;
        }
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            flow_id TEXT PRIMARY KEY,
            flow_name TEXT NOT NULL,
            version INTEGER NOT NULL,
            state TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS terminated_flows (
            flow_id TEXT PRIMARY KEY,
            terminated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_terminated_flows_at ON terminated_flows(terminated_at);

        -- Holds only undelivered outputs; delivery deletes the row.
        CREATE TABLE IF NOT EXISTS output_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            flow_id TEXT NOT NULL,
            topic TEXT NOT NULL,
            record_key TEXT NOT NULL,
            record TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

impl CheckpointStore for SqliteCheckpointStore {
    fn load(&self, flow_id: &FlowId) -> StoreResult<Option<FlowCheckpoint>> {
        let conn = self.conn.lock();
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT version, state FROM checkpoints WHERE flow_id = ?",
                params![flow_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((version, state)) => {
                let mut checkpoint: FlowCheckpoint = serde_json::from_str(&state)?;
                checkpoint.version = version as u64;
                Ok(Some(checkpoint))
            }
            None => Ok(None),
        }
    }

    fn save(
        &self,
        flow_id: &FlowId,
        expected_version: u64,
        checkpoint: Option<&FlowCheckpoint>,
        outputs: &[OutputRecord],
    ) -> StoreResult<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().timestamp_millis();

        let stored = Self::stored_version(&tx, flow_id)?;
        let found = stored.unwrap_or(0);
        if found != expected_version {
            warn!(flow_id = %flow_id, expected = expected_version, found, "Checkpoint version conflict");
            return Err(StoreError::VersionConflict {
                flow_id: flow_id.clone(),
                expected: expected_version,
                found,
            });
        }

        let next_version = expected_version + 1;
        match checkpoint {
            Some(checkpoint) => {
                if stored.is_none() && Self::terminated(&tx, flow_id)? {
                    return Err(StoreError::Terminated(flow_id.clone()));
                }
                let mut record = checkpoint.clone();
                record.version = next_version;
                let state = serde_json::to_string(&record)?;
                tx.execute(
                    r#"INSERT INTO checkpoints (flow_id, flow_name, version, state, updated_at)
                       VALUES (?1, ?2, ?3, ?4, ?5)
                       ON CONFLICT(flow_id) DO UPDATE SET
                         version = excluded.version,
                         state = excluded.state,
                         updated_at = excluded.updated_at"#,
                    params![flow_id.as_str(), record.flow_name, next_version as i64, state, now],
                )?;
            }
            None => {
                tx.execute("DELETE FROM checkpoints WHERE flow_id = ?", params![flow_id.as_str()])?;
                tx.execute(
                    "INSERT OR IGNORE INTO terminated_flows (flow_id, terminated_at) VALUES (?, ?)",
                    params![flow_id.as_str(), now],
                )?;
            }
        }

        #[cfg(test)]
        if self.fail_before_outputs.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Injected);
        }

        Self::append_outputs(&tx, flow_id, outputs, now)?;
        tx.commit()?;

        debug!(
            flow_id = %flow_id,
            version = next_version,
            outputs = outputs.len(),
            terminated = checkpoint.is_none(),
            "Committed checkpoint"
        );
        Ok(next_version)
    }

    fn is_terminated(&self, flow_id: &FlowId) -> StoreResult<bool> {
        let conn = self.conn.lock();
        Self::terminated(&conn, flow_id)
    }

    fn list_flows(&self) -> StoreResult<Vec<FlowId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT flow_id FROM checkpoints ORDER BY flow_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut flows = Vec::new();
        for row in rows {
            flows.push(FlowId::from_string(row?));
        }
        Ok(flows)
    }

    fn prune_terminated(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM terminated_flows WHERE terminated_at < ?",
            params![before.timestamp_millis()],
        )?;
        if removed > 0 {
            debug!(removed, "Pruned terminated flow markers");
        }
        Ok(removed)
    }
}

impl OutputLog for SqliteCheckpointStore {
    fn pending_outputs(&self, limit: usize) -> StoreResult<Vec<LoggedOutput>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, flow_id, record, created_at FROM output_log ORDER BY id LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut outputs = Vec::new();
        for row in rows {
            let (id, flow_id, record, created_at) = row?;
            outputs.push(LoggedOutput {
                id,
                flow_id: FlowId::from_string(flow_id),
                record: serde_json::from_str(&record)?,
                created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_default(),
            });
        }
        Ok(outputs)
    }

    fn mark_delivered(&self, ids: &[i64]) -> StoreResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM output_log WHERE id = ?")?;
            for id in ids {
                removed += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }
}
