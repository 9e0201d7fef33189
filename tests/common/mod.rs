//! Shared fixtures for integration tests.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use upkeep_engine::config::{AppConfig, CliConfig, FileConfig};
use upkeep_engine::engine_store::EngineDb;
use upkeep_engine::scheduling::clock::ManualClock;
use upkeep_engine::tasks::lock::{AdvisoryLock, FileAdvisoryLocks};
use upkeep_engine::tasks::result::{Counts, TaskResult};
use upkeep_engine::tasks::task::{
    Frequency, MaintenanceTask, RunOptions, TaskContext, TaskError,
};
use upkeep_engine::Engine;

/// Which lock path the engine uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPath {
    /// `flock` files, with the database records as fallback.
    File,
    /// Database records only.
    Records,
}

pub struct TestEngine {
    pub engine: Engine,
    pub clock: Arc<ManualClock>,
    pub config: AppConfig,
    // Kept alive for the duration of the test
    _temp_dir: TempDir,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 10, 0, 0).unwrap()
}

/// Builds an isolated engine in a fresh directory. `toml` is used as the
/// config file contents; `db_dir` is filled in.
pub fn engine_with(toml: &str, locks: LockPath) -> TestEngine {
    let temp_dir = TempDir::new().unwrap();
    let cli = CliConfig {
        db_dir: Some(temp_dir.path().to_path_buf()),
        ..Default::default()
    };
    let file_config = FileConfig::parse(toml).unwrap();
    let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

    let clock = Arc::new(ManualClock::new(start_time()));
    let db = EngineDb::open(config.engine_db_path()).unwrap();
    let primary: Option<Arc<dyn AdvisoryLock>> = match locks {
        LockPath::File => Some(Arc::new(FileAdvisoryLocks::new(config.lock_dir()))),
        LockPath::Records => None,
    };
    let engine = Engine::assemble(&config, db, primary, clock.clone()).unwrap();

    TestEngine {
        engine,
        clock,
        config,
        _temp_dir: temp_dir,
    }
}

pub fn engine() -> TestEngine {
    engine_with("", LockPath::File)
}

/// A task that counts its runs and can be held inside `run` until released.
pub struct ProbeTask {
    id: &'static str,
    frequency: Frequency,
    pub runs: AtomicUsize,
    pub inside: AtomicUsize,
    hold: AtomicBool,
}

impl ProbeTask {
    pub fn new(id: &'static str, frequency: Frequency) -> Arc<Self> {
        Arc::new(Self {
            id,
            frequency,
            runs: AtomicUsize::new(0),
            inside: AtomicUsize::new(0),
            hold: AtomicBool::new(false),
        })
    }

    /// Makes the next runs block until `release` is called.
    pub fn hold(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.hold.store(false, Ordering::SeqCst);
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl MaintenanceTask for ProbeTask {
    fn id(&self) -> &'static str {
        self.id
    }

    fn name(&self) -> &'static str {
        "Probe"
    }

    fn description(&self) -> &'static str {
        "Counts its runs"
    }

    fn default_frequency(&self) -> Frequency {
        self.frequency
    }

    fn run(&self, ctx: &TaskContext, _options: &RunOptions) -> Result<TaskResult, TaskError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.inside.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.hold.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        self.inside.fetch_sub(1, Ordering::SeqCst);
        Ok(TaskResult::success(&ctx.task_id, Counts::new(3, 2, 1024)))
    }
}
