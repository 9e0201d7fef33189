//! Precise one-shot action queue.
//!
//! Every run is its own row in `queued_actions`. A recurring action carries its
//! interval; when it is claimed, the next occurrence is queued as a fresh
//! pending row. Finished rows stay around for introspection until purged.

use super::backend::{
    BackendKind, DueTrigger, Recurrence, SchedulingError, TriggerBackend, TriggerOutcome,
};
use super::clock::Clock;
use super::poller::next_tick_after;
use crate::engine_store::{from_millis, EngineDb};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

const QUEUE_TABLE: &str = "queued_actions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Skipped,
    Canceled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Running => "running",
            ActionStatus::Complete => "complete",
            ActionStatus::Failed => "failed",
            ActionStatus::Skipped => "skipped",
            ActionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ActionStatus::Pending),
            "running" => Some(ActionStatus::Running),
            "complete" => Some(ActionStatus::Complete),
            "failed" => Some(ActionStatus::Failed),
            "skipped" => Some(ActionStatus::Skipped),
            "canceled" => Some(ActionStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, ActionStatus::Pending | ActionStatus::Running)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedAction {
    pub id: i64,
    pub dispatch_key: String,
    pub status: ActionStatus,
    pub scheduled_at: DateTime<Utc>,
    pub interval_secs: Option<u64>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

pub struct ActionQueueBackend {
    db: EngineDb,
    clock: Arc<dyn Clock>,
}

impl ActionQueueBackend {
    pub fn new(db: EngineDb, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Capability probe: the queue needs the v2 schema.
    pub fn is_supported(db: &EngineDb) -> Result<bool> {
        db.has_table(QUEUE_TABLE)
    }

    fn row_to_action(row: &rusqlite::Row) -> rusqlite::Result<QueuedAction> {
        let status: String = row.get("status")?;
        Ok(QueuedAction {
            id: row.get("id")?,
            dispatch_key: row.get("hook")?,
            status: ActionStatus::parse(&status).unwrap_or(ActionStatus::Failed),
            scheduled_at: from_millis(row.get("scheduled_at")?),
            interval_secs: row
                .get::<_, Option<i64>>("interval_secs")?
                .map(|s| s.max(0) as u64),
            claimed_at: row.get::<_, Option<i64>>("claimed_at")?.map(from_millis),
            finished_at: row.get::<_, Option<i64>>("finished_at")?.map(from_millis),
            message: row.get("message")?,
        })
    }

    fn insert_pending(
        conn: &rusqlite::Connection,
        dispatch_key: &str,
        at_ms: i64,
        interval_secs: Option<u64>,
    ) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO queued_actions (hook, status, scheduled_at, interval_secs)
             VALUES (?1, 'pending', ?2, ?3)",
            params![dispatch_key, at_ms, interval_secs.map(|s| s as i64)],
        )
    }

    /// Actions filtered by key and/or status, newest first.
    pub fn list_actions(
        &self,
        dispatch_key: Option<&str>,
        status: Option<ActionStatus>,
    ) -> Result<Vec<QueuedAction>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM queued_actions
             WHERE (?1 IS NULL OR hook = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY scheduled_at DESC, id DESC",
        )?;
        let actions = stmt
            .query_map(
                params![dispatch_key, status.map(|s| s.as_str())],
                Self::row_to_action,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(actions)
    }

    /// Deletes finished actions that ended before `before`.
    pub fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        let deleted = self.db.conn().execute(
            "DELETE FROM queued_actions
             WHERE status IN ('complete', 'failed', 'skipped', 'canceled')
               AND COALESCE(finished_at, scheduled_at) < ?1",
            params![before.timestamp_millis()],
        )?;
        Ok(deleted)
    }

    /// Marks actions claimed before `before` and never completed as failed.
    /// These were left behind by a process that died mid-run.
    pub fn fail_abandoned(&self, before: DateTime<Utc>) -> Result<usize> {
        let updated = self.db.conn().execute(
            "UPDATE queued_actions
             SET status = 'failed', finished_at = ?1, message = 'abandoned'
             WHERE status = 'running' AND claimed_at < ?2",
            params![
                self.clock.now().timestamp_millis(),
                before.timestamp_millis()
            ],
        )?;
        if updated > 0 {
            warn!("Marked {} abandoned queue actions as failed", updated);
        }
        Ok(updated)
    }
}

impl TriggerBackend for ActionQueueBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Queue
    }

    fn register_recurring(
        &self,
        dispatch_key: &str,
        interval_secs: u64,
        first_run_at: DateTime<Utc>,
    ) -> Result<(), SchedulingError> {
        if interval_secs == 0 {
            return Err(SchedulingError::UnsupportedInterval {
                backend: BackendKind::Queue,
                interval_secs,
            });
        }
        Self::insert_pending(
            &self.db.conn(),
            dispatch_key,
            first_run_at.timestamp_millis(),
            Some(interval_secs),
        )
        .map_err(anyhow::Error::from)?;
        debug!(
            "Queue: {} every {}s from {}",
            dispatch_key, interval_secs, first_run_at
        );
        Ok(())
    }

    fn register_single(&self, dispatch_key: &str, at: DateTime<Utc>) -> Result<()> {
        Self::insert_pending(&self.db.conn(), dispatch_key, at.timestamp_millis(), None)?;
        Ok(())
    }

    /// Cancels pending actions. Running ones are left to finish.
    fn clear_all(&self, dispatch_key: &str) -> Result<usize> {
        let canceled = self.db.conn().execute(
            "UPDATE queued_actions SET status = 'canceled', finished_at = ?1
             WHERE hook = ?2 AND status = 'pending'",
            params![self.clock.now().timestamp_millis(), dispatch_key],
        )?;
        Ok(canceled)
    }

    fn next_scheduled(&self, dispatch_key: &str) -> Result<Option<DateTime<Utc>>> {
        let next: Option<i64> = self.db.conn().query_row(
            "SELECT MIN(scheduled_at) FROM queued_actions WHERE hook = ?1 AND status = 'pending'",
            params![dispatch_key],
            |row| row.get(0),
        )?;
        Ok(next.map(from_millis))
    }

    fn recurrence(&self, dispatch_key: &str) -> Result<Option<Recurrence>> {
        let interval: Option<i64> = self
            .db
            .conn()
            .query_row(
                "SELECT interval_secs FROM queued_actions
                 WHERE hook = ?1 AND status = 'pending' AND interval_secs IS NOT NULL
                 ORDER BY scheduled_at LIMIT 1",
                params![dispatch_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(interval.map(|secs| Recurrence::Interval(secs.max(0) as u64)))
    }

    fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<DueTrigger>> {
        let now_ms = now.timestamp_millis();
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        let due = {
            let mut stmt = tx.prepare(
                "SELECT id, hook, scheduled_at, interval_secs FROM queued_actions
                 WHERE status = 'pending' AND scheduled_at <= ?1
                 ORDER BY scheduled_at, id",
            )?;
            let rows = stmt
                .query_map(params![now_ms], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut triggers = Vec::with_capacity(due.len());
        for (id, hook, scheduled_at, interval_secs) in due {
            let claimed = tx.execute(
                "UPDATE queued_actions SET status = 'running', claimed_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now_ms, id],
            )?;
            if claimed != 1 {
                continue;
            }
            if let Some(interval) = interval_secs.filter(|s| *s > 0) {
                let next = next_tick_after(scheduled_at, interval as u64, now_ms);
                Self::insert_pending(&tx, &hook, next, Some(interval as u64))?;
            }
            triggers.push(DueTrigger {
                dispatch_key: hook,
                scheduled_for: from_millis(scheduled_at),
                action_id: Some(id),
                recurring: interval_secs.is_some(),
            });
        }
        tx.commit()?;
        Ok(triggers)
    }

    fn complete(&self, trigger: &DueTrigger, outcome: &TriggerOutcome) -> Result<()> {
        let Some(id) = trigger.action_id else {
            return Ok(());
        };
        let (status, message) = match outcome {
            TriggerOutcome::Completed => (ActionStatus::Complete, None),
            TriggerOutcome::Interrupted => (ActionStatus::Complete, Some("interrupted".to_string())),
            TriggerOutcome::Skipped => (ActionStatus::Skipped, Some("lock held".to_string())),
            TriggerOutcome::Failed(error) => (ActionStatus::Failed, Some(error.clone())),
        };
        self.db.conn().execute(
            "UPDATE queued_actions SET status = ?1, finished_at = ?2, message = ?3
             WHERE id = ?4 AND status = 'running'",
            params![
                status.as_str(),
                self.clock.now().timestamp_millis(),
                message,
                id
            ],
        )?;
        Ok(())
    }

    fn next_wakeup(&self) -> Result<Option<DateTime<Utc>>> {
        let next: Option<i64> = self.db.conn().query_row(
            "SELECT MIN(scheduled_at) FROM queued_actions WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(next.map(from_millis))
    }

    fn recover_abandoned(&self, before: DateTime<Utc>) -> Result<usize> {
        self.fail_abandoned(before)
    }
}
