//! Built-in housekeeping jobs. They look after the engine's own tables.

pub mod action_log_cleanup;
pub mod progress_pruning;
pub mod run_history_cleanup;
pub mod stale_lock_sweep;

pub use action_log_cleanup::ActionLogCleanupJob;
pub use progress_pruning::ProgressPruningJob;
pub use run_history_cleanup::RunHistoryCleanupJob;
pub use stale_lock_sweep::StaleLockSweepJob;

/// Id prefix shared by the built-in jobs.
pub const HOUSEKEEPING_PREFIX: &str = "housekeeping.";

/// A window of `days` days, saturating at the largest representable span.
pub fn days_window(days: u64) -> chrono::Duration {
    i64::try_from(days)
        .ok()
        .and_then(chrono::Duration::try_days)
        .unwrap_or(chrono::Duration::MAX)
}

/// Per-run override of a day count, read from the task's own settings.
pub(crate) fn days_option(ctx: &super::task::TaskContext, key: &str, default: u64) -> u64 {
    ctx.settings.option_u64(key).unwrap_or(default)
}
