//! Wires the stores, locks, registry and scheduling service together.

use crate::config::AppConfig;
use crate::engine_store::EngineDb;
use crate::scheduling::action_queue::ActionQueueBackend;
use crate::scheduling::backend::TriggerBackends;
use crate::scheduling::clock::{Clock, SystemClock};
use crate::scheduling::runner::TriggerRunner;
use crate::scheduling::service::SchedulingService;
use crate::scheduling::settings::ConfigSettings;
use crate::tasks::jobs::{
    ActionLogCleanupJob, ProgressPruningJob, RunHistoryCleanupJob, StaleLockSweepJob,
};
use crate::tasks::lock::{AdvisoryLock, FileAdvisoryLocks, LockManager, SqliteLockRecords};
use crate::tasks::progress::SqliteProgressStore;
use crate::tasks::registry::TaskRegistry;
use crate::tasks::run_log::SqliteRunLog;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Engine {
    db: EngineDb,
    clock: Arc<dyn Clock>,
    settings: Arc<ConfigSettings>,
    progress: Arc<SqliteProgressStore>,
    run_log: Arc<SqliteRunLog>,
    lock_records: Arc<SqliteLockRecords>,
    registry: Arc<TaskRegistry>,
    scheduling: Arc<SchedulingService>,
    poll_interval: Duration,
}

impl Engine {
    /// Opens the database under `db_dir` and builds an engine with file
    /// locks and the system clock.
    pub fn build(config: &AppConfig) -> Result<Self> {
        let db_path = config.engine_db_path();
        let db = EngineDb::open(&db_path)
            .with_context(|| format!("Failed to open engine database {:?}", db_path))?;
        let primary: Arc<dyn AdvisoryLock> = Arc::new(FileAdvisoryLocks::new(config.lock_dir()));
        Self::assemble(config, db, Some(primary), Arc::new(SystemClock))
    }

    /// Builds an engine around an open database. Without `primary_lock` only
    /// the lock records in the database are used.
    pub fn assemble(
        config: &AppConfig,
        db: EngineDb,
        primary_lock: Option<Arc<dyn AdvisoryLock>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let settings = Arc::new(config.settings_source());
        let progress = Arc::new(SqliteProgressStore::with_clock(db.clone(), clock.clone()));
        let run_log = Arc::new(SqliteRunLog::new(db.clone()));
        let lock_records = Arc::new(SqliteLockRecords::with_clock(
            db.clone(),
            config.scheduler.lock_ttl,
            clock.clone(),
        ));

        let registry = Arc::new(
            TaskRegistry::new(
                LockManager::new(primary_lock, lock_records.clone()),
                progress.clone(),
                run_log.clone(),
                settings.clone(),
                config.registry_options(),
            )
            .with_clock(clock.clone()),
        );

        let backends = TriggerBackends::select(&db, config.scheduler.backend, clock.clone())?;
        let scheduling = Arc::new(SchedulingService::new(
            registry.clone(),
            backends,
            clock.clone(),
        ));

        let engine = Self {
            db,
            clock,
            settings,
            progress,
            run_log,
            lock_records,
            registry,
            scheduling,
            poll_interval: config.scheduler.poll_interval,
        };
        engine.register_builtin_jobs(config)?;
        Ok(engine)
    }

    fn register_builtin_jobs(&self, config: &AppConfig) -> Result<()> {
        let jobs = &config.jobs;
        self.registry
            .register(Arc::new(ProgressPruningJob::new(jobs.progress_max_age_days)));
        self.registry.register(Arc::new(RunHistoryCleanupJob::new(
            self.run_log.clone(),
            jobs.run_history_retention_days,
            jobs.cleanup_batch_size,
        )));
        self.registry
            .register(Arc::new(StaleLockSweepJob::new(self.lock_records.clone())));

        if ActionQueueBackend::is_supported(&self.db)? {
            let queue = Arc::new(ActionQueueBackend::new(self.db.clone(), self.clock.clone()));
            self.registry.register(Arc::new(ActionLogCleanupJob::new(
                queue,
                jobs.action_log_retention_days,
            )));
        }

        info!("Registered {} tasks", self.registry.ids().len());
        Ok(())
    }

    pub fn db(&self) -> &EngineDb {
        &self.db
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Runtime-editable settings. Changes take effect on the next
    /// reconciliation or execution.
    pub fn settings(&self) -> &Arc<ConfigSettings> {
        &self.settings
    }

    pub fn progress(&self) -> &Arc<SqliteProgressStore> {
        &self.progress
    }

    pub fn run_log(&self) -> &Arc<SqliteRunLog> {
        &self.run_log
    }

    pub fn lock_records(&self) -> &Arc<SqliteLockRecords> {
        &self.lock_records
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn scheduling(&self) -> &Arc<SchedulingService> {
        &self.scheduling
    }

    pub fn runner(&self, shutdown_token: CancellationToken) -> TriggerRunner {
        TriggerRunner::new(
            self.registry.clone(),
            self.scheduling.backends().clone(),
            self.clock.clone(),
            self.poll_interval,
            shutdown_token,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliConfig;
    use crate::scheduling::backend::BackendKind;
    use crate::tasks::jobs::HOUSEKEEPING_PREFIX;
    use tempfile::TempDir;

    #[test]
    fn test_build_registers_housekeeping_jobs() {
        let temp_dir = TempDir::new().unwrap();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli, None).unwrap();

        let engine = Engine::build(&config).unwrap();

        let ids: Vec<&str> = engine
            .registry()
            .get_by_category(HOUSEKEEPING_PREFIX)
            .iter()
            .map(|task| task.id())
            .collect();
        assert_eq!(
            ids,
            vec![
                "housekeeping.action_log_cleanup",
                "housekeeping.progress_pruning",
                "housekeeping.run_history_cleanup",
                "housekeeping.stale_lock_sweep",
            ]
        );
        assert_eq!(
            engine.scheduling().backends().active().kind(),
            BackendKind::Queue
        );
        assert!(config.engine_db_path().exists());
    }
}
