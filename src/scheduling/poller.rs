//! Simple periodic poller with a fixed set of named intervals.

use super::backend::{
    BackendKind, DueTrigger, Recurrence, SchedulingError, TriggerBackend, TriggerOutcome,
};
use super::clock::Clock;
use crate::engine_store::{from_millis, EngineDb};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::debug;

/// Named schedules the poller understands, with their intervals in seconds.
pub const NAMED_SCHEDULES: &[(&str, u64)] = &[
    ("hourly", 60 * 60),
    ("twicedaily", 12 * 60 * 60),
    ("daily", 24 * 60 * 60),
    ("weekly", 7 * 24 * 60 * 60),
    ("monthly", 30 * 24 * 60 * 60),
];

pub fn schedule_name_for(interval_secs: u64) -> Option<&'static str> {
    NAMED_SCHEDULES
        .iter()
        .find(|(_, secs)| *secs == interval_secs)
        .map(|(name, _)| *name)
}

pub fn schedule_interval(name: &str) -> Option<u64> {
    NAMED_SCHEDULES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, secs)| *secs)
}

/// First tick of a recurrence strictly after `now`.
pub(crate) fn next_tick_after(scheduled_ms: i64, interval_secs: u64, now_ms: i64) -> i64 {
    let interval_ms = (interval_secs as i64).saturating_mul(1000).max(1);
    if scheduled_ms > now_ms {
        return scheduled_ms;
    }
    let missed = (now_ms - scheduled_ms) / interval_ms + 1;
    scheduled_ms.saturating_add(missed.saturating_mul(interval_ms))
}

/// Registrations in the `poller_events` table. Single events have no
/// `schedule`.
pub struct PollerBackend {
    db: EngineDb,
    clock: Arc<dyn Clock>,
}

impl PollerBackend {
    pub fn new(db: EngineDb, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Number of registrations for the key.
    pub fn count(&self, dispatch_key: &str) -> Result<usize> {
        let count: i64 = self.db.conn().query_row(
            "SELECT COUNT(*) FROM poller_events WHERE hook = ?1",
            params![dispatch_key],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl TriggerBackend for PollerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Poller
    }

    fn register_recurring(
        &self,
        dispatch_key: &str,
        interval_secs: u64,
        first_run_at: DateTime<Utc>,
    ) -> Result<(), SchedulingError> {
        let schedule =
            schedule_name_for(interval_secs).ok_or(SchedulingError::UnsupportedInterval {
                backend: BackendKind::Poller,
                interval_secs,
            })?;
        self.db
            .conn()
            .execute(
                "INSERT INTO poller_events (hook, schedule, interval_secs, next_run_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    dispatch_key,
                    schedule,
                    interval_secs as i64,
                    first_run_at.timestamp_millis()
                ],
            )
            .map_err(anyhow::Error::from)?;
        debug!(
            "Poller: {} scheduled {} from {}",
            dispatch_key, schedule, first_run_at
        );
        Ok(())
    }

    fn register_single(&self, dispatch_key: &str, at: DateTime<Utc>) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO poller_events (hook, schedule, interval_secs, next_run_at)
             VALUES (?1, NULL, NULL, ?2)",
            params![dispatch_key, at.timestamp_millis()],
        )?;
        Ok(())
    }

    fn clear_all(&self, dispatch_key: &str) -> Result<usize> {
        let deleted = self.db.conn().execute(
            "DELETE FROM poller_events WHERE hook = ?1",
            params![dispatch_key],
        )?;
        Ok(deleted)
    }

    fn next_scheduled(&self, dispatch_key: &str) -> Result<Option<DateTime<Utc>>> {
        let next: Option<i64> = self.db.conn().query_row(
            "SELECT MIN(next_run_at) FROM poller_events WHERE hook = ?1",
            params![dispatch_key],
            |row| row.get(0),
        )?;
        Ok(next.map(from_millis))
    }

    fn recurrence(&self, dispatch_key: &str) -> Result<Option<Recurrence>> {
        let schedule: Option<String> = self
            .db
            .conn()
            .query_row(
                "SELECT schedule FROM poller_events
                 WHERE hook = ?1 AND schedule IS NOT NULL
                 ORDER BY next_run_at LIMIT 1",
                params![dispatch_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(schedule.map(Recurrence::Named))
    }

    /// Recurring events move to their next tick after `now`; any ticks missed
    /// while nobody polled collapse into this one. Single events are removed.
    fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<DueTrigger>> {
        let now_ms = now.timestamp_millis();
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        let due = {
            let mut stmt = tx.prepare(
                "SELECT id, hook, interval_secs, next_run_at FROM poller_events
                 WHERE next_run_at <= ?1 ORDER BY next_run_at, id",
            )?;
            let rows = stmt
                .query_map(params![now_ms], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut triggers = Vec::with_capacity(due.len());
        for (id, hook, interval_secs, next_run_at) in due {
            match interval_secs {
                Some(interval) if interval > 0 => {
                    let next = next_tick_after(next_run_at, interval as u64, now_ms);
                    tx.execute(
                        "UPDATE poller_events SET next_run_at = ?1 WHERE id = ?2",
                        params![next, id],
                    )?;
                }
                _ => {
                    tx.execute("DELETE FROM poller_events WHERE id = ?1", params![id])?;
                }
            }
            triggers.push(DueTrigger {
                dispatch_key: hook,
                scheduled_for: from_millis(next_run_at),
                action_id: None,
                recurring: interval_secs.is_some(),
            });
        }
        tx.commit()?;
        Ok(triggers)
    }

    fn complete(&self, trigger: &DueTrigger, outcome: &TriggerOutcome) -> Result<()> {
        debug!(
            "Poller: {} finished at {}: {:?}",
            trigger.dispatch_key,
            self.clock.now(),
            outcome
        );
        Ok(())
    }

    fn next_wakeup(&self) -> Result<Option<DateTime<Utc>>> {
        let next: Option<i64> =
            self.db
                .conn()
                .query_row("SELECT MIN(next_run_at) FROM poller_events", [], |row| {
                    row.get(0)
                })?;
        Ok(next.map(from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::clock::ManualClock;
    use chrono::{Duration, TimeZone};

    fn backend() -> PollerBackend {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        ));
        PollerBackend::new(EngineDb::open_in_memory().unwrap(), clock)
    }

    #[test]
    fn test_named_schedule_lookup() {
        assert_eq!(schedule_name_for(86_400), Some("daily"));
        assert_eq!(schedule_name_for(43_200), Some("twicedaily"));
        assert_eq!(schedule_name_for(1234), None);
        assert_eq!(schedule_interval("weekly"), Some(604_800));
    }

    #[test]
    fn test_unsupported_interval_is_rejected() {
        let poller = backend();
        let err = poller
            .register_recurring("k", 90, Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulingError::UnsupportedInterval {
                interval_secs: 90,
                ..
            }
        ));
        assert_eq!(poller.count("k").unwrap(), 0);
    }

    #[test]
    fn test_register_and_clear() {
        let poller = backend();
        let first = Utc.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).unwrap();
        poller.register_recurring("k", 86_400, first).unwrap();
        poller
            .register_single("k", first - Duration::hours(1))
            .unwrap();

        assert_eq!(poller.next_scheduled("k").unwrap(), Some(first - Duration::hours(1)));
        assert_eq!(
            poller.recurrence("k").unwrap(),
            Some(Recurrence::Named("daily".to_string()))
        );

        assert_eq!(poller.clear_all("k").unwrap(), 2);
        assert_eq!(poller.clear_all("k").unwrap(), 0);
        assert_eq!(poller.next_scheduled("k").unwrap(), None);
        assert_eq!(poller.recurrence("k").unwrap(), None);
    }

    #[test]
    fn test_claim_due_advances_recurring_and_drops_single() {
        let poller = backend();
        let first = Utc.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).unwrap();
        poller.register_recurring("daily", 86_400, first).unwrap();
        poller.register_single("once", first).unwrap();

        assert!(poller
            .claim_due(first - Duration::seconds(1))
            .unwrap()
            .is_empty());

        // Three days late: one trigger, next tick tomorrow relative to now.
        let now = first + Duration::days(3) + Duration::hours(1);
        let due = poller.claim_due(now).unwrap();
        assert_eq!(due.len(), 2);
        assert!(due.iter().any(|t| t.dispatch_key == "daily" && t.recurring));
        assert!(due.iter().any(|t| t.dispatch_key == "once" && !t.recurring));

        assert_eq!(
            poller.next_scheduled("daily").unwrap(),
            Some(first + Duration::days(4))
        );
        assert_eq!(poller.next_scheduled("once").unwrap(), None);
        assert_eq!(poller.next_wakeup().unwrap(), Some(first + Duration::days(4)));
        assert!(poller.claim_due(now).unwrap().is_empty());
    }
}
