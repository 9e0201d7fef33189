//! Removes fallback lock records whose holder never released them.

use crate::tasks::lock::SqliteLockRecords;
use crate::tasks::result::{Counts, TaskResult};
use crate::tasks::task::{Frequency, MaintenanceTask, RunOptions, TaskContext, TaskError};
use std::sync::Arc;
use tracing::{info, warn};

pub const STALE_LOCK_SWEEP_ID: &str = "housekeeping.stale_lock_sweep";

pub struct StaleLockSweepJob {
    records: Arc<SqliteLockRecords>,
}

impl StaleLockSweepJob {
    pub fn new(records: Arc<SqliteLockRecords>) -> Self {
        Self { records }
    }
}

impl MaintenanceTask for StaleLockSweepJob {
    fn id(&self) -> &'static str {
        STALE_LOCK_SWEEP_ID
    }

    fn name(&self) -> &'static str {
        "Stale Lock Sweep"
    }

    fn description(&self) -> &'static str {
        "Delete lock records held past their TTL"
    }

    fn default_frequency(&self) -> Frequency {
        Frequency::Daily
    }

    fn run(&self, ctx: &TaskContext, _options: &RunOptions) -> Result<TaskResult, TaskError> {
        let expired: Vec<_> = self
            .records
            .list()?
            .into_iter()
            .filter(|info| info.is_expired_at(ctx.now()))
            .collect();
        for info in &expired {
            warn!(
                "Lock {} held by {} since {} expired",
                info.name, info.holder, info.acquired_at
            );
        }

        let swept = self.records.sweep_expired()? as u64;
        if swept > 0 {
            info!("Swept {} expired lock records", swept);
        }
        Ok(TaskResult::success(
            &ctx.task_id,
            Counts::new(expired.len() as u64, swept, 0),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_store::EngineDb;
    use crate::scheduling::clock::ManualClock;
    use crate::tasks::progress::SqliteProgressStore;
    use crate::tasks::task::{TaskSettings, TimeBudget};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    #[test]
    fn test_sweeps_only_expired_records() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        ));
        let db = EngineDb::open_in_memory().unwrap();
        let records = Arc::new(SqliteLockRecords::with_clock(
            db.clone(),
            Duration::from_secs(300),
            clock.clone(),
        ));

        assert!(records.try_acquire("upkeep_lock_old", "dead-holder").unwrap());
        clock.advance(chrono::Duration::minutes(10));
        assert!(records.try_acquire("upkeep_lock_new", "live-holder").unwrap());

        let ctx = TaskContext::new(
            STALE_LOCK_SWEEP_ID,
            Arc::new(SqliteProgressStore::new(db)),
            TaskSettings::default(),
            TimeBudget::new(Duration::from_secs(25)),
            Duration::from_secs(60),
            clock,
        );
        let result = StaleLockSweepJob::new(records.clone())
            .run(&ctx, &RunOptions::scheduled())
            .unwrap();

        assert_eq!(result.items_found(), 1);
        assert_eq!(result.items_cleaned(), 1);
        assert!(records.inspect("upkeep_lock_old").unwrap().is_none());
        assert!(records.inspect("upkeep_lock_new").unwrap().is_some());
    }
}
