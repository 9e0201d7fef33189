//! Checkpoint persistence for tasks that span several invocations.
//!
//! A [`ProgressStore`] is **not** safe for concurrent writers on the same task.
//! The read-modify-write helpers rely on the task lock held by the registry for
//! the whole run, so only one writer per task exists at any time.

use crate::engine_store::{from_millis, EngineDb};
use crate::scheduling::clock::{Clock, SystemClock};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use tracing::{debug, warn};

/// Key injected by `load()` with the RFC 3339 save time.
pub const SAVED_AT_KEY: &str = "saved_at";
/// Key injected by `load()` when the checkpoint came from an interrupted run.
pub const INTERRUPTED_AT_KEY: &str = "interrupted_at";
/// List maintained by `add_completed_task`.
pub const COMPLETED_TASKS_KEY: &str = "completed_tasks";
/// Map maintained by `add_error`.
pub const ERRORS_KEY: &str = "errors";

pub type Checkpoint = Map<String, JsonValue>;

/// A stored checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRecord {
    pub task_id: String,
    pub data: Checkpoint,
    pub saved_at: DateTime<Utc>,
    pub interrupted_at: Option<DateTime<Utc>>,
}

pub trait ProgressStore: Send + Sync {
    /// Stored checkpoint, or `None` if there is none or it is unreadable.
    fn read(&self, task_id: &str) -> Result<Option<ProgressRecord>>;

    /// Replaces the checkpoint for `task_id`.
    fn write(&self, record: &ProgressRecord) -> Result<()>;

    /// Returns whether a checkpoint existed.
    fn delete(&self, task_id: &str) -> Result<bool>;

    /// Deletes every checkpoint saved before `threshold`, returns how many.
    fn delete_saved_before(&self, threshold: DateTime<Utc>) -> Result<usize>;

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Checkpoint data with `saved_at` / `interrupted_at` injected. Empty when
    /// there is no checkpoint.
    fn load(&self, task_id: &str) -> Result<Checkpoint> {
        let Some(record) = self.read(task_id)? else {
            return Ok(Checkpoint::new());
        };
        let mut data = record.data;
        data.insert(
            SAVED_AT_KEY.to_string(),
            JsonValue::String(record.saved_at.to_rfc3339()),
        );
        if let Some(interrupted_at) = record.interrupted_at {
            data.insert(
                INTERRUPTED_AT_KEY.to_string(),
                JsonValue::String(interrupted_at.to_rfc3339()),
            );
        }
        Ok(data)
    }

    fn save(&self, task_id: &str, data: &Checkpoint) -> Result<()> {
        self.write(&ProgressRecord {
            task_id: task_id.to_string(),
            data: strip_reserved(data),
            saved_at: self.now(),
            interrupted_at: None,
        })
    }

    /// Like `save`, additionally marking the run as not completed.
    fn save_interrupted(&self, task_id: &str, data: &Checkpoint) -> Result<()> {
        let now = self.now();
        self.write(&ProgressRecord {
            task_id: task_id.to_string(),
            data: strip_reserved(data),
            saved_at: now,
            interrupted_at: Some(now),
        })
    }

    /// Merges `updates` into the checkpoint. An existing interrupted marker is
    /// kept.
    fn update(&self, task_id: &str, updates: Checkpoint) -> Result<()> {
        let existing = self.read(task_id)?;
        let interrupted_at = existing.as_ref().and_then(|r| r.interrupted_at);
        let mut data = existing.map(|r| r.data).unwrap_or_default();
        for (key, value) in strip_reserved(&updates) {
            data.insert(key, value);
        }
        self.write(&ProgressRecord {
            task_id: task_id.to_string(),
            data,
            saved_at: self.now(),
            interrupted_at,
        })
    }

    /// Adds `by` to the integer at `key` (missing or non-numeric counts as 0)
    /// and returns the new value.
    fn increment(&self, task_id: &str, key: &str, by: i64) -> Result<i64> {
        let current = self
            .read(task_id)?
            .and_then(|r| r.data.get(key).and_then(JsonValue::as_i64))
            .unwrap_or(0);
        let value = current.saturating_add(by);
        let mut updates = Checkpoint::new();
        updates.insert(key.to_string(), JsonValue::from(value));
        self.update(task_id, updates)?;
        Ok(value)
    }

    /// Appends `item` to the completed list unless it is already there.
    fn add_completed_task(&self, task_id: &str, item: &str) -> Result<()> {
        let mut completed = self
            .read(task_id)?
            .and_then(|r| r.data.get(COMPLETED_TASKS_KEY).cloned())
            .and_then(|v| match v {
                JsonValue::Array(items) => Some(items),
                _ => None,
            })
            .unwrap_or_default();
        if completed.iter().any(|v| v.as_str() == Some(item)) {
            return Ok(());
        }
        completed.push(JsonValue::String(item.to_string()));
        let mut updates = Checkpoint::new();
        updates.insert(COMPLETED_TASKS_KEY.to_string(), JsonValue::Array(completed));
        self.update(task_id, updates)
    }

    fn add_error(&self, task_id: &str, key: &str, message: &str) -> Result<()> {
        let mut errors = self
            .read(task_id)?
            .and_then(|r| r.data.get(ERRORS_KEY).cloned())
            .and_then(|v| match v {
                JsonValue::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default();
        errors.insert(key.to_string(), JsonValue::String(message.to_string()));
        let mut updates = Checkpoint::new();
        updates.insert(ERRORS_KEY.to_string(), JsonValue::Object(errors));
        self.update(task_id, updates)
    }

    fn has_progress(&self, task_id: &str) -> Result<bool> {
        Ok(self.read(task_id)?.is_some())
    }

    /// True if there is no checkpoint or it was saved more than `max_age` ago.
    /// An age reaching past the earliest representable time never expires.
    fn is_stale(&self, task_id: &str, max_age: Duration) -> Result<bool> {
        Ok(match self.read(task_id)? {
            None => true,
            Some(record) => match self.now().checked_sub_signed(max_age) {
                Some(threshold) => record.saved_at < threshold,
                None => false,
            },
        })
    }

    /// Removes checkpoints of all tasks older than `max_age`.
    fn prune_stale(&self, max_age: Duration) -> Result<usize> {
        match self.now().checked_sub_signed(max_age) {
            Some(threshold) => self.delete_saved_before(threshold),
            None => Ok(0),
        }
    }

    /// Removes the checkpoint so the next run starts clean.
    fn clear(&self, task_id: &str) -> Result<bool> {
        self.delete(task_id)
    }
}

fn strip_reserved(data: &Checkpoint) -> Checkpoint {
    data.iter()
        .filter(|(key, _)| key.as_str() != SAVED_AT_KEY && key.as_str() != INTERRUPTED_AT_KEY)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Checkpoints stored in the `task_progress` table.
pub struct SqliteProgressStore {
    db: EngineDb,
    clock: Arc<dyn Clock>,
}

impl SqliteProgressStore {
    pub fn new(db: EngineDb) -> Self {
        Self::with_clock(db, Arc::new(SystemClock))
    }

    pub fn with_clock(db: EngineDb, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// All stored checkpoints, oldest first.
    pub fn list(&self) -> Result<Vec<ProgressRecord>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT task_id, payload, saved_at, interrupted_at FROM task_progress ORDER BY saved_at",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(task_id, payload, saved_at, interrupted_at)| {
                Self::decode(task_id, &payload, saved_at, interrupted_at)
            })
            .collect())
    }

    fn decode(
        task_id: String,
        payload: &str,
        saved_at: i64,
        interrupted_at: Option<i64>,
    ) -> Option<ProgressRecord> {
        match serde_json::from_str::<JsonValue>(payload) {
            Ok(JsonValue::Object(data)) => Some(ProgressRecord {
                task_id,
                data,
                saved_at: from_millis(saved_at),
                interrupted_at: interrupted_at.map(from_millis),
            }),
            Ok(other) => {
                warn!(
                    "Ignoring checkpoint for {}: expected an object, found {}",
                    task_id,
                    json_kind(&other)
                );
                None
            }
            Err(e) => {
                warn!("Ignoring unreadable checkpoint for {}: {}", task_id, e);
                None
            }
        }
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

impl ProgressStore for SqliteProgressStore {
    fn read(&self, task_id: &str) -> Result<Option<ProgressRecord>> {
        let conn = self.db.conn();
        let row = conn
            .query_row(
                "SELECT payload, saved_at, interrupted_at FROM task_progress WHERE task_id = ?1",
                params![task_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("Failed to read checkpoint for {}", task_id))?;
        Ok(row.and_then(|(payload, saved_at, interrupted_at)| {
            Self::decode(task_id.to_string(), &payload, saved_at, interrupted_at)
        }))
    }

    fn write(&self, record: &ProgressRecord) -> Result<()> {
        let payload = serde_json::to_string(&record.data)?;
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO task_progress (task_id, payload, saved_at, interrupted_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(task_id) DO UPDATE SET
                payload = excluded.payload,
                saved_at = excluded.saved_at,
                interrupted_at = excluded.interrupted_at",
            params![
                record.task_id,
                payload,
                record.saved_at.timestamp_millis(),
                record.interrupted_at.map(|t| t.timestamp_millis()),
            ],
        )
        .with_context(|| format!("Failed to save checkpoint for {}", record.task_id))?;
        debug!(
            "Saved checkpoint for {} ({} keys, interrupted={})",
            record.task_id,
            record.data.len(),
            record.interrupted_at.is_some()
        );
        Ok(())
    }

    fn delete(&self, task_id: &str) -> Result<bool> {
        let conn = self.db.conn();
        let deleted = conn.execute(
            "DELETE FROM task_progress WHERE task_id = ?1",
            params![task_id],
        )?;
        Ok(deleted > 0)
    }

    fn delete_saved_before(&self, threshold: DateTime<Utc>) -> Result<usize> {
        let conn = self.db.conn();
        let deleted = conn.execute(
            "DELETE FROM task_progress WHERE saved_at < ?1",
            params![threshold.timestamp_millis()],
        )?;
        Ok(deleted)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
