//! Deletes checkpoints nobody has touched for a while.
//!
//! A checkpoint outlives its run only when the run was interrupted and never
//! continued, e.g. the task was disabled or its continuation was lost.

use super::{days_option, days_window};
use crate::tasks::result::{Counts, TaskResult};
use crate::tasks::task::{Frequency, MaintenanceTask, RunOptions, TaskContext, TaskError};
use serde_json::json;
use tracing::info;

pub const PROGRESS_PRUNING_ID: &str = "housekeeping.progress_pruning";

pub struct ProgressPruningJob {
    max_age_days: u64,
}

impl ProgressPruningJob {
    pub fn new(max_age_days: u64) -> Self {
        Self { max_age_days }
    }
}

impl MaintenanceTask for ProgressPruningJob {
    fn id(&self) -> &'static str {
        PROGRESS_PRUNING_ID
    }

    fn name(&self) -> &'static str {
        "Progress Pruning"
    }

    fn description(&self) -> &'static str {
        "Delete checkpoints of interrupted runs that were never resumed"
    }

    fn default_frequency(&self) -> Frequency {
        Frequency::Weekly
    }

    fn settings_schema(&self) -> Option<serde_json::Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "max_age_days": { "type": "integer", "minimum": 1 }
            }
        }))
    }

    fn run(&self, ctx: &TaskContext, _options: &RunOptions) -> Result<TaskResult, TaskError> {
        let max_age_days = days_option(ctx, "max_age_days", self.max_age_days);
        if max_age_days == 0 {
            return Err(TaskError::InvalidOptions(
                "max_age_days must be at least 1".to_string(),
            ));
        }

        let pruned = ctx
            .progress
            .prune_stale(days_window(max_age_days))?;
        info!(
            "Pruned {} checkpoints older than {} days",
            pruned, max_age_days
        );

        let pruned = pruned as u64;
        Ok(TaskResult::success(
            &ctx.task_id,
            Counts::new(pruned, pruned, 0),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_store::EngineDb;
    use crate::scheduling::clock::ManualClock;
    use crate::tasks::progress::{Checkpoint, ProgressStore, SqliteProgressStore};
    use crate::tasks::task::{TaskSettings, TimeBudget};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    fn context(
        progress: Arc<SqliteProgressStore>,
        clock: Arc<ManualClock>,
        settings: TaskSettings,
    ) -> TaskContext {
        TaskContext::new(
            PROGRESS_PRUNING_ID,
            progress,
            settings,
            TimeBudget::new(Duration::from_secs(25)),
            Duration::from_secs(60),
            clock,
        )
    }

    #[test]
    fn test_prunes_only_old_checkpoints() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        let db = EngineDb::open_in_memory().unwrap();
        let progress = Arc::new(SqliteProgressStore::with_clock(db, clock.clone()));

        let mut data = Checkpoint::new();
        data.insert("offset".to_string(), 10.into());
        progress.save_interrupted("old", &data).unwrap();
        clock.advance(chrono::Duration::days(10));
        progress.save_interrupted("fresh", &data).unwrap();

        let job = ProgressPruningJob::new(7);
        let ctx = context(progress.clone(), clock, TaskSettings::default());
        let result = job.run(&ctx, &RunOptions::manual()).unwrap();

        assert!(result.is_success());
        assert_eq!(result.items_cleaned(), 1);
        assert!(!progress.has_progress("old").unwrap());
        assert!(progress.has_progress("fresh").unwrap());
    }

    #[test]
    fn test_zero_age_is_rejected() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let progress = Arc::new(SqliteProgressStore::new(EngineDb::open_in_memory().unwrap()));
        let mut settings = TaskSettings::default();
        settings
            .options
            .insert("max_age_days".to_string(), 0.into());

        let job = ProgressPruningJob::new(7);
        let err = job
            .run(&context(progress, clock, settings), &RunOptions::manual())
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidOptions(_)));
    }
}
