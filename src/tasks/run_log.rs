//! Where finished task results go.

use super::result::TaskResult;
use crate::engine_store::EngineDb;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::{error, info, warn};

/// Receives every result the registry produces, exactly once per execution.
pub trait ResultSink: Send + Sync {
    fn record(&self, result: &TaskResult) -> Result<()>;
}

/// A stored result.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRunRecord {
    pub id: i64,
    pub result: TaskResult,
}

/// Rows and payload bytes removed by a purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgedRows {
    pub rows: usize,
    pub bytes: u64,
}

/// Result log in the `task_runs` table. Also emits one log line per result.
pub struct SqliteRunLog {
    db: EngineDb,
}

impl SqliteRunLog {
    pub fn new(db: EngineDb) -> Self {
        Self { db }
    }

    /// Most recent results for a task, newest first.
    pub fn history(&self, task_id: &str, limit: usize) -> Result<Vec<TaskRunRecord>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, record FROM task_runs WHERE task_id = ?1
             ORDER BY executed_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![task_id, limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, record) in rows {
            match serde_json::from_str::<TaskResult>(&record) {
                Ok(result) => records.push(TaskRunRecord { id, result }),
                Err(e) => warn!("Skipping unreadable run record {}: {}", id, e),
            }
        }
        Ok(records)
    }

    pub fn last_run(&self, task_id: &str) -> Result<Option<TaskRunRecord>> {
        Ok(self.history(task_id, 1)?.into_iter().next())
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .db
            .conn()
            .query_row("SELECT COUNT(*) FROM task_runs", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Deletes up to `limit` of the oldest rows executed before `threshold`.
    pub fn delete_batch_before(&self, threshold: DateTime<Utc>, limit: usize) -> Result<PurgedRows> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        let (rows, bytes): (i64, i64) = tx.query_row(
            "SELECT COUNT(*), COALESCE(SUM(LENGTH(record)), 0) FROM (
                SELECT record FROM task_runs WHERE executed_at < ?1 ORDER BY id LIMIT ?2
             )",
            params![threshold.timestamp_millis(), limit as i64],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        tx.execute(
            "DELETE FROM task_runs WHERE id IN (
                SELECT id FROM task_runs WHERE executed_at < ?1 ORDER BY id LIMIT ?2
             )",
            params![threshold.timestamp_millis(), limit as i64],
        )?;
        tx.commit()?;
        Ok(PurgedRows {
            rows: rows as usize,
            bytes: bytes.max(0) as u64,
        })
    }
}

impl ResultSink for SqliteRunLog {
    fn record(&self, result: &TaskResult) -> Result<()> {
        let record = serde_json::to_string(result)?;
        self.db
            .conn()
            .execute(
                "INSERT INTO task_runs (task_id, executed_at, success, interrupted,
                    items_found, items_cleaned, bytes_freed, elapsed_time, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    result.task_id(),
                    result.executed_at().timestamp_millis(),
                    result.is_success(),
                    result.is_interrupted(),
                    result.items_found() as i64,
                    result.items_cleaned() as i64,
                    result.bytes_freed() as i64,
                    result.elapsed_time(),
                    record,
                ],
            )
            .with_context(|| format!("Failed to record result for {}", result.task_id()))?;

        if result.is_success() {
            info!("Task {}", result);
        } else {
            error!("Task {} errors: {:?}", result, result.errors());
        }
        Ok(())
    }
}
