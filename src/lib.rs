//! Upkeep Engine Library
//!
//! Scheduled, lock-protected maintenance tasks with resumable progress and
//! pluggable trigger backends.

pub mod config;
pub mod engine;
pub mod engine_store;
pub mod metrics;
pub mod scheduling;
pub mod sqlite_persistence;
pub mod tasks;

// Re-export commonly used types for convenience
pub use engine::Engine;
pub use scheduling::{ReconcileReport, SchedulingService, TriggerRunner};
pub use tasks::{
    ExecuteOutcome, Frequency, MaintenanceTask, ProgressStore, TaskContext, TaskError,
    TaskRegistry, TaskResult,
};
