//! Purges finished rows from the action queue.

use super::{days_option, days_window};
use crate::scheduling::action_queue::ActionQueueBackend;
use crate::tasks::result::{Counts, TaskResult};
use crate::tasks::task::{Frequency, MaintenanceTask, RunOptions, TaskContext, TaskError};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

pub const ACTION_LOG_CLEANUP_ID: &str = "housekeeping.action_log_cleanup";

pub struct ActionLogCleanupJob {
    queue: Arc<ActionQueueBackend>,
    retention_days: u64,
}

impl ActionLogCleanupJob {
    pub fn new(queue: Arc<ActionQueueBackend>, retention_days: u64) -> Self {
        Self {
            queue,
            retention_days,
        }
    }
}

impl MaintenanceTask for ActionLogCleanupJob {
    fn id(&self) -> &'static str {
        ACTION_LOG_CLEANUP_ID
    }

    fn name(&self) -> &'static str {
        "Action Log Cleanup"
    }

    fn description(&self) -> &'static str {
        "Delete finished queue actions older than the retention period"
    }

    fn default_frequency(&self) -> Frequency {
        Frequency::Monthly
    }

    fn settings_schema(&self) -> Option<serde_json::Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "retention_days": { "type": "integer", "minimum": 1 }
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

        let purged = match ctx.now().checked_sub_signed(days_window(retention_days)) {
            Some(cutoff) => self.queue.purge_finished(cutoff)? as u64,
            None => 0,
        };
        info!(
            "Purged {} finished queue actions older than {} days",
            purged, retention_days
        );
        Ok(TaskResult::success(
            &ctx.task_id,
            Counts::new(purged, purged, 0),
        ))
    }
}
