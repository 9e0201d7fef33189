//! Maintenance tasks and the machinery that runs them.

pub mod jobs;
pub mod lock;
pub mod progress;
pub mod registry;
pub mod result;
pub mod run_log;
pub mod task;

pub use lock::{AdvisoryLock, FileAdvisoryLocks, LockInfo, LockManager, SqliteLockRecords};
pub use progress::{Checkpoint, ProgressRecord, ProgressStore, SqliteProgressStore};
pub use registry::{
    dispatch_key, ExecuteOutcome, RegistryError, RegistryOptions, TaskDefinitionInfo,
    TaskRegistry,
};
pub use result::{Counts, ResultUpdate, TaskResult};
pub use run_log::{ResultSink, SqliteRunLog, TaskRunRecord};
pub use task::{
    Frequency, MaintenanceTask, RunOptions, TaskContext, TaskError, TaskSettings, TimeBudget,
    TriggerSource,
};
