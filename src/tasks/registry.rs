//! Catalog of tasks and the single dispatch point trigger backends call into.

use super::lock::LockManager;
use super::progress::ProgressStore;
use super::result::{ResultUpdate, TaskResult};
use super::run_log::ResultSink;
use super::task::{Frequency, MaintenanceTask, RunOptions, TaskContext, TimeBudget};
use crate::metrics;
use crate::scheduling::backend::TriggerBackend;
use crate::scheduling::clock::{Clock, SystemClock};
use crate::scheduling::settings::SettingsSource;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// Prefix shared by every dispatch key.
pub const DISPATCH_PREFIX: &str = "upkeep_run_";

/// Error key used for panics caught at the registry boundary.
pub const PANIC_ERROR_KEY: &str = "panic";

/// The key trigger backends use to address a task.
pub fn dispatch_key(task_id: &str) -> String {
    format!("{}{}", DISPATCH_PREFIX, task_id)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Unknown dispatch key: {0}")]
    UnknownDispatchKey(String),
}

/// What `execute` did.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteOutcome {
    Completed(TaskResult),
    /// Another invocation held the lock. Nothing ran and nothing is retried.
    Skipped,
}

impl ExecuteOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, ExecuteOutcome::Skipped)
    }

    pub fn result(&self) -> Option<&TaskResult> {
        match self {
            ExecuteOutcome::Completed(result) => Some(result),
            ExecuteOutcome::Skipped => None,
        }
    }

    pub fn into_result(self) -> Option<TaskResult> {
        match self {
            ExecuteOutcome::Completed(result) => Some(result),
            ExecuteOutcome::Skipped => None,
        }
    }
}

/// Serializable view of a registered task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskDefinitionInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub default_frequency: Frequency,
    pub frequency: Frequency,
    pub enabled: bool,
    pub dispatch_key: String,
    pub next_run: Option<DateTime<Utc>>,
    pub settings_schema: Option<JsonValue>,
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryOptions {
    /// Budget for runs that don't specify one.
    pub default_time_budget: Duration,
    /// Delay before an interrupted run is continued.
    pub resume_delay: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            default_time_budget: Duration::from_secs(25),
            resume_delay: Duration::from_secs(60),
        }
    }
}

pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<dyn MaintenanceTask>>>,
    locks: LockManager,
    progress: Arc<dyn ProgressStore>,
    sink: Arc<dyn ResultSink>,
    settings: Arc<dyn SettingsSource>,
    options: RegistryOptions,
    clock: Arc<dyn Clock>,
}

impl TaskRegistry {
    pub fn new(
        locks: LockManager,
        progress: Arc<dyn ProgressStore>,
        sink: Arc<dyn ResultSink>,
        settings: Arc<dyn SettingsSource>,
        options: RegistryOptions,
    ) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            locks,
            progress,
            sink,
            settings,
            options,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Adds a task, replacing any previous task with the same id.
    pub fn register(&self, task: Arc<dyn MaintenanceTask>) {
        let id = task.id().to_string();
        let replaced = self.tasks.write().unwrap().insert(id.clone(), task);
        if replaced.is_some() {
            info!("Replaced task definition {}", id);
        } else {
            info!("Registered task {} ({})", id, dispatch_key(&id));
        }
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<dyn MaintenanceTask>> {
        self.tasks.read().unwrap().get(task_id).cloned()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.read().unwrap().contains_key(task_id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Tasks whose id starts with `prefix`, sorted by id.
    pub fn get_by_category(&self, prefix: &str) -> Vec<Arc<dyn MaintenanceTask>> {
        let mut tasks: Vec<Arc<dyn MaintenanceTask>> = self
            .tasks
            .read()
            .unwrap()
            .iter()
            .filter(|(id, _)| id.starts_with(prefix))
            .map(|(_, task)| task.clone())
            .collect();
        tasks.sort_by(|a, b| a.id().cmp(b.id()));
        tasks
    }

    /// Task id addressed by a dispatch key, if it is registered.
    pub fn resolve_dispatch_key(&self, key: &str) -> Option<String> {
        key.strip_prefix(DISPATCH_PREFIX)
            .filter(|id| self.contains(id))
            .map(str::to_string)
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn settings(&self) -> &Arc<dyn SettingsSource> {
        &self.settings
    }

    /// Configured frequency, falling back to the task default.
    pub fn effective_frequency(&self, task: &dyn MaintenanceTask) -> Frequency {
        self.settings
            .task(task.id())
            .frequency
            .unwrap_or_else(|| task.default_frequency())
    }

    pub fn execute_dispatch(
        &self,
        key: &str,
        options: RunOptions,
    ) -> Result<ExecuteOutcome, RegistryError> {
        let task_id = self
            .resolve_dispatch_key(key)
            .ok_or_else(|| RegistryError::UnknownDispatchKey(key.to_string()))?;
        self.execute(&task_id, options)
    }

    /// Runs a task under its lock.
    ///
    /// Returns `Skipped` if the lock is held elsewhere. Otherwise exactly one
    /// result is produced and handed to the result sink, whatever the task
    /// body did, and the lock is released before returning.
    pub fn execute(
        &self,
        task_id: &str,
        options: RunOptions,
    ) -> Result<ExecuteOutcome, RegistryError> {
        let task = self
            .get(task_id)
            .ok_or_else(|| RegistryError::UnknownTask(task_id.to_string()))?;

        let Some(_guard) = self.locks.guard(task_id) else {
            info!("Task {} is already running, skipping this trigger", task_id);
            metrics::record_task_execution(task_id, "skipped", None);
            return Ok(ExecuteOutcome::Skipped);
        };

        info!("Running task {} (trigger: {})", task_id, options.trigger);
        metrics::set_task_running(task_id, true);
        let executed_at = self.clock.now();
        let started = Instant::now();

        let budget = options
            .time_budget
            .unwrap_or(self.options.default_time_budget);
        let ctx = TaskContext::new(
            task_id,
            self.progress.clone(),
            self.settings.task(task_id),
            TimeBudget::new(budget),
            self.options.resume_delay,
            self.clock.clone(),
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.run(&ctx, &options)));
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!("Task {} failed: {}", task_id, e);
                TaskResult::from_error(task_id, e.error_key(), e.to_string())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Task {} panicked: {}", task_id, message);
                TaskResult::from_error(task_id, PANIC_ERROR_KEY, message)
            }
        };

        let elapsed = started.elapsed();
        let result = result.with(ResultUpdate {
            executed_at: Some(executed_at),
            elapsed_time: Some(elapsed.as_secs_f64()),
            ..Default::default()
        });

        if result.is_success() && !result.is_interrupted() {
            if let Err(e) = self.progress.clear(task_id) {
                warn!("Failed to clear checkpoint for {}: {:#}", task_id, e);
            }
        }

        if let Err(e) = self.sink.record(&result) {
            warn!("Failed to record result for {}: {:#}", task_id, e);
        }

        metrics::set_task_running(task_id, false);
        metrics::record_task_execution(task_id, result.status(), Some(elapsed));

        Ok(ExecuteOutcome::Completed(result))
    }

    /// Flattens the catalog for display. `backend` supplies next run times.
    pub fn get_task_definitions(&self, backend: &dyn TriggerBackend) -> Vec<TaskDefinitionInfo> {
        let mut tasks: Vec<Arc<dyn MaintenanceTask>> =
            self.tasks.read().unwrap().values().cloned().collect();
        tasks.sort_by(|a, b| a.id().cmp(b.id()));

        tasks
            .into_iter()
            .map(|task| {
                let key = dispatch_key(task.id());
                let settings = self.settings.task(task.id());
                let next_run = backend.next_scheduled(&key).unwrap_or_else(|e| {
                    warn!("Failed to read next run for {}: {:#}", task.id(), e);
                    None
                });
                TaskDefinitionInfo {
                    id: task.id().to_string(),
                    name: task.name().to_string(),
                    description: task.description().to_string(),
                    default_frequency: task.default_frequency(),
                    frequency: self.effective_frequency(task.as_ref()),
                    enabled: task.is_enabled(&settings),
                    dispatch_key: key,
                    next_run,
                    settings_schema: task.settings_schema(),
                }
            })
            .collect()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_store::EngineDb;
    use crate::scheduling::clock::SystemClock;
    use crate::scheduling::poller::PollerBackend;
    use crate::scheduling::settings::ConfigSettings;
    use crate::tasks::lock::{SqliteLockRecords, DEFAULT_LOCK_TTL};
    use crate::tasks::progress::SqliteProgressStore;
    use crate::tasks::result::Counts;
    use crate::tasks::run_log::SqliteRunLog;
    use crate::tasks::task::TaskError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Succeed,
        Fail,
        Panic,
        Interrupt,
    }

    struct TestTask {
        id: &'static str,
        behavior: Behavior,
        run_count: AtomicUsize,
    }

    impl TestTask {
        fn new(id: &'static str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                id,
                behavior,
                run_count: AtomicUsize::new(0),
            })
        }
    }

    impl MaintenanceTask for TestTask {
        fn id(&self) -> &'static str {
            self.id
        }

        fn name(&self) -> &'static str {
            "Test Task"
        }

        fn description(&self) -> &'static str {
            "A test task"
        }

        fn default_frequency(&self) -> Frequency {
            Frequency::Weekly
        }

        fn run(&self, ctx: &TaskContext, _options: &RunOptions) -> Result<TaskResult, TaskError> {
            self.run_count.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => Ok(TaskResult::success(self.id, Counts::new(3, 2, 1))),
                Behavior::Fail => Err(TaskError::Failed("nothing to do".into())),
                Behavior::Panic => panic!("kaboom"),
                Behavior::Interrupt => {
                    ctx.progress
                        .save_interrupted(self.id, json!({"offset": 1}).as_object().unwrap())?;
                    Ok(TaskResult::interrupted(
                        self.id,
                        Counts::found(1),
                        Some(ctx.resume_at()),
                    ))
                }
            }
        }
    }

    struct Fixture {
        registry: TaskRegistry,
        progress: Arc<SqliteProgressStore>,
        log: Arc<SqliteRunLog>,
        db: EngineDb,
    }

    fn fixture() -> Fixture {
        let db = EngineDb::open_in_memory().unwrap();
        let progress = Arc::new(SqliteProgressStore::new(db.clone()));
        let log = Arc::new(SqliteRunLog::new(db.clone()));
        let locks = LockManager::new(
            None,
            Arc::new(SqliteLockRecords::new(db.clone(), DEFAULT_LOCK_TTL)),
        );
        let registry = TaskRegistry::new(
            locks,
            progress.clone(),
            log.clone(),
            Arc::new(ConfigSettings::default()),
            RegistryOptions::default(),
        );
        Fixture {
            registry,
            progress,
            log,
            db,
        }
    }

    #[test]
    fn test_execute_success_passes_result_through() {
        let f = fixture();
        let task = TestTask::new("t", Behavior::Succeed);
        f.registry.register(task.clone());
        f.progress
            .save("t", json!({"offset": 9}).as_object().unwrap())
            .unwrap();

        let outcome = f.registry.execute("t", RunOptions::manual()).unwrap();
        let result = outcome.result().unwrap();
        assert!(result.is_success());
        assert_eq!(result.counts(), Counts::new(3, 2, 1));
        assert_eq!(task.run_count.load(Ordering::SeqCst), 1);

        // Completed run clears the checkpoint, releases the lock and logs once.
        assert!(!f.progress.has_progress("t").unwrap());
        assert!(f.registry.locks().inspect("t").unwrap().is_none());
        assert_eq!(f.log.count().unwrap(), 1);
    }

    #[test]
    fn test_execute_converts_error_to_failure() {
        let f = fixture();
        f.registry.register(TestTask::new("t", Behavior::Fail));

        let result = f
            .registry
            .execute("t", RunOptions::scheduled())
            .unwrap()
            .into_result()
            .unwrap();
        assert!(!result.is_success());
        assert_eq!(
            result.errors().get("run").map(String::as_str),
            Some("nothing to do")
        );
        assert!(f.registry.locks().inspect("t").unwrap().is_none());
    }

    #[test]
    fn test_execute_catches_panic_and_releases_lock() {
        let f = fixture();
        f.registry.register(TestTask::new("t", Behavior::Panic));

        let result = f
            .registry
            .execute("t", RunOptions::scheduled())
            .unwrap()
            .into_result()
            .unwrap();
        assert!(!result.is_success());
        assert_eq!(
            result.errors().get(PANIC_ERROR_KEY).map(String::as_str),
            Some("kaboom")
        );
        assert!(f.registry.locks().acquire("t"));
        assert_eq!(f.log.count().unwrap(), 1);
    }

    #[test]
    fn test_interrupted_run_keeps_checkpoint() {
        let f = fixture();
        f.registry.register(TestTask::new("t", Behavior::Interrupt));

        let result = f
            .registry
            .execute("t", RunOptions::scheduled())
            .unwrap()
            .into_result()
            .unwrap();
        assert!(result.is_interrupted());
        assert!(result.next_run().is_some());
        assert!(f.progress.has_progress("t").unwrap());
    }

    #[test]
    fn test_held_lock_skips() {
        let f = fixture();
        let task = TestTask::new("t", Behavior::Succeed);
        f.registry.register(task.clone());

        assert!(f.registry.locks().acquire("t"));
        let outcome = f.registry.execute("t", RunOptions::scheduled()).unwrap();
        assert!(outcome.is_skipped());
        assert_eq!(task.run_count.load(Ordering::SeqCst), 0);
        assert_eq!(f.log.count().unwrap(), 0);
    }

    #[test]
    fn test_unknown_task_and_dispatch_key() {
        let f = fixture();
        f.registry.register(TestTask::new("t", Behavior::Succeed));

        assert_eq!(
            f.registry.execute("nope", RunOptions::manual()).unwrap_err(),
            RegistryError::UnknownTask("nope".into())
        );
        assert_eq!(
            f.registry
                .execute_dispatch("t", RunOptions::manual())
                .unwrap_err(),
            RegistryError::UnknownDispatchKey("t".into())
        );
        assert!(f
            .registry
            .execute_dispatch(&dispatch_key("t"), RunOptions::manual())
            .unwrap()
            .result()
            .is_some());
    }

    #[test]
    fn test_register_replaces_and_category_filter() {
        let f = fixture();
        let first = TestTask::new("housekeeping.a", Behavior::Fail);
        let second = TestTask::new("housekeeping.a", Behavior::Succeed);
        f.registry.register(first.clone());
        f.registry.register(second.clone());
        f.registry.register(TestTask::new("housekeeping.b", Behavior::Succeed));
        f.registry.register(TestTask::new("reports.c", Behavior::Succeed));

        f.registry
            .execute("housekeeping.a", RunOptions::manual())
            .unwrap();
        assert_eq!(first.run_count.load(Ordering::SeqCst), 0);
        assert_eq!(second.run_count.load(Ordering::SeqCst), 1);

        let ids: Vec<&str> = f
            .registry
            .get_by_category("housekeeping.")
            .iter()
            .map(|t| t.id())
            .collect();
        assert_eq!(ids, vec!["housekeeping.a", "housekeeping.b"]);
    }

    #[test]
    fn test_task_definitions() {
        let f = fixture();
        f.registry.register(TestTask::new("t", Behavior::Succeed));
        let poller = PollerBackend::new(f.db.clone(), Arc::new(SystemClock));
        let at = Utc::now() + chrono::Duration::hours(1);
        poller.register_single(&dispatch_key("t"), at).unwrap();

        let defs = f.registry.get_task_definitions(&poller);
        assert_eq!(defs.len(), 1);
        let def = &defs[0];
        assert_eq!(def.dispatch_key, "upkeep_run_t");
        assert_eq!(def.default_frequency, Frequency::Weekly);
        assert_eq!(def.frequency, Frequency::Weekly);
        assert!(def.enabled);
        assert_eq!(
            def.next_run.map(|t| t.timestamp_millis()),
            Some(at.timestamp_millis())
        );

        let json = serde_json::to_value(&defs).unwrap();
        assert_eq!(json[0]["default_frequency"], json!("weekly"));
    }
}
