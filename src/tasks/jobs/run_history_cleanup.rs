//! Deletes old rows from the run log in batches.
//!
//! The cutoff is fixed when a pass starts and carried in the checkpoint, so a
//! pass continued later deletes against the same cutoff.

use super::{days_option, days_window};
use crate::tasks::progress::Checkpoint;
use crate::tasks::result::{Counts, TaskResult};
use crate::tasks::run_log::SqliteRunLog;
use crate::tasks::task::{Frequency, MaintenanceTask, RunOptions, TaskContext, TaskError};
use byte_unit::Byte;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tracing::{debug, info};

pub const RUN_HISTORY_CLEANUP_ID: &str = "housekeeping.run_history_cleanup";

const CUTOFF_KEY: &str = "cutoff";
const ROWS_KEY: &str = "rows_deleted";
const BYTES_KEY: &str = "bytes_freed";

pub struct RunHistoryCleanupJob {
    run_log: Arc<SqliteRunLog>,
    retention_days: u64,
    batch_size: usize,
}

impl RunHistoryCleanupJob {
    pub fn new(run_log: Arc<SqliteRunLog>, retention_days: u64, batch_size: usize) -> Self {
        Self {
            run_log,
            retention_days,
            batch_size: batch_size.max(1),
        }
    }

    fn resume_cutoff(checkpoint: &Checkpoint) -> Option<DateTime<Utc>> {
        checkpoint
            .get(CUTOFF_KEY)
            .and_then(JsonValue::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

impl MaintenanceTask for RunHistoryCleanupJob {
    fn id(&self) -> &'static str {
        RUN_HISTORY_CLEANUP_ID
    }

    fn name(&self) -> &'static str {
        "Run History Cleanup"
    }

    fn description(&self) -> &'static str {
        "Delete task run records older than the retention period"
    }

    fn default_frequency(&self) -> Frequency {
        Frequency::Weekly
    }

    fn settings_schema(&self) -> Option<JsonValue> {
        Some(json!({
            "type": "object",
            "properties": {
                "retention_days": { "type": "integer", "minimum": 1 },
                "batch_size": { "type": "integer", "minimum": 1 }
            }
        }))
    }

    fn run(&self, ctx: &TaskContext, _options: &RunOptions) -> Result<TaskResult, TaskError> {
        let retention_days = days_option(ctx, "retention_days", self.retention_days);
        if retention_days == 0 {
            return Err(TaskError::InvalidOptions(
                "retention_days must be at least 1".to_string(),
            ));
        }
        let batch_size = ctx
            .settings
            .option_u64("batch_size")
            .map(|n| n.max(1) as usize)
            .unwrap_or(self.batch_size);

        let checkpoint = ctx.progress.load(&ctx.task_id)?;
        let cutoff = match Self::resume_cutoff(&checkpoint) {
            Some(cutoff) => {
                debug!("Resuming run history cleanup with cutoff {}", cutoff);
                cutoff
            }
            None => match ctx.now().checked_sub_signed(days_window(retention_days)) {
                Some(cutoff) => cutoff,
                None => return Ok(TaskResult::success(&ctx.task_id, Counts::default())),
            },
        };

        let mut counts = Counts::default();
        loop {
            let purged = self.run_log.delete_batch_before(cutoff, batch_size)?;
            let rows = purged.rows as u64;
            counts = counts.saturating_add(Counts::new(rows, rows, purged.bytes));

            if purged.rows < batch_size {
                break;
            }
            if ctx.should_yield() {
                let mut data = Checkpoint::new();
                data.insert(CUTOFF_KEY.to_string(), json!(cutoff.to_rfc3339()));
                data.insert(
                    ROWS_KEY.to_string(),
                    json!(checkpoint_u64(&checkpoint, ROWS_KEY) + counts.items_cleaned),
                );
                data.insert(
                    BYTES_KEY.to_string(),
                    json!(checkpoint_u64(&checkpoint, BYTES_KEY) + counts.bytes_freed),
                );
                ctx.progress.save_interrupted(&ctx.task_id, &data)?;
                info!(
                    "Run history cleanup yielding after {} rows, continuing at {}",
                    counts.items_cleaned,
                    ctx.resume_at()
                );
                return Ok(TaskResult::interrupted(
                    &ctx.task_id,
                    counts,
                    Some(ctx.resume_at()),
                ));
            }
        }

        let earlier_rows = checkpoint_u64(&checkpoint, ROWS_KEY);
        let earlier = Counts::new(
            earlier_rows,
            earlier_rows,
            checkpoint_u64(&checkpoint, BYTES_KEY),
        );
        let result = TaskResult::success(&ctx.task_id, counts).add_counts(earlier);
        info!(
            "Run history cleanup removed {} rows ({:#}) older than {}",
            result.items_cleaned(),
            Byte::from(result.bytes_freed()),
            cutoff
        );
        Ok(result)
    }
}

fn checkpoint_u64(checkpoint: &Checkpoint, key: &str) -> u64 {
    checkpoint.get(key).and_then(JsonValue::as_u64).unwrap_or(0)
}
