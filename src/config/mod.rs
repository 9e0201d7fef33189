mod file_config;

pub use file_config::{FileConfig, JobsConfig, SchedulerConfig};

use crate::scheduling::backend::BackendPreference;
use crate::scheduling::settings::{ConfigSettings, GlobalSettings, DEFAULT_PREFERRED_HOUR};
use crate::tasks::lock::DEFAULT_LOCK_TTL;
use crate::tasks::registry::RegistryOptions;
use crate::tasks::task::TaskSettings;
use anyhow::{anyhow, bail, Result};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// TOML values take precedence over these.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub backend: Option<BackendPreference>,
    pub timezone: Option<String>,
    pub preferred_hour: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub scheduler: SchedulerSettings,
    pub jobs: JobsSettings,
    pub tasks: HashMap<String, TaskSettings>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub preferred_hour: i32,
    pub timezone: Tz,
    pub backend: BackendPreference,
    pub lock_ttl: Duration,
    pub time_budget: Duration,
    pub resume_delay: Duration,
    pub poll_interval: Duration,
    /// Directory for advisory lock files. Defaults to `<db_dir>/locks`.
    pub lock_dir: Option<PathBuf>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let registry = RegistryOptions::default();
        Self {
            enabled: true,
            preferred_hour: DEFAULT_PREFERRED_HOUR,
            timezone: Tz::UTC,
            backend: BackendPreference::Auto,
            lock_ttl: DEFAULT_LOCK_TTL,
            time_budget: registry.default_time_budget,
            resume_delay: registry.resume_delay,
            poll_interval: Duration::from_secs(60),
            lock_dir: None,
        }
    }
}

/// Settings of the built-in housekeeping jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobsSettings {
    pub progress_max_age_days: u64,
    pub run_history_retention_days: u64,
    pub action_log_retention_days: u64,
    pub cleanup_batch_size: usize,
}

impl Default for JobsSettings {
    fn default() -> Self {
        Self {
            progress_max_age_days: 7,
            run_history_retention_days: 30,
            action_log_retention_days: 31,
            cleanup_batch_size: 500,
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| anyhow!("db_dir must be specified via --db-dir or in config file"))?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let metrics_port = file.metrics_port.or(cli.metrics_port);

        let sched_file = file.scheduler.unwrap_or_default();
        let defaults = SchedulerSettings::default();

        let preferred_hour = sched_file
            .preferred_hour
            .or(cli.preferred_hour)
            .unwrap_or(defaults.preferred_hour);
        if !(0..=23).contains(&preferred_hour) {
            bail!("preferred_hour must be between 0 and 23, got {}", preferred_hour);
        }

        let timezone = match sched_file.timezone.or_else(|| cli.timezone.clone()) {
            Some(name) => parse_timezone(&name)?,
            None => defaults.timezone,
        };

        let backend = match sched_file.backend {
            Some(name) => name.parse::<BackendPreference>().map_err(|e| anyhow!(e))?,
            None => cli.backend.unwrap_or(defaults.backend),
        };

        let secs_or = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_secs).unwrap_or(default)
        };
        let scheduler = SchedulerSettings {
            enabled: sched_file.enabled.unwrap_or(defaults.enabled),
            preferred_hour,
            timezone,
            backend,
            lock_ttl: secs_or(sched_file.lock_ttl_secs, defaults.lock_ttl),
            time_budget: secs_or(sched_file.time_budget_secs, defaults.time_budget),
            resume_delay: secs_or(sched_file.resume_delay_secs, defaults.resume_delay),
            poll_interval: secs_or(sched_file.poll_interval_secs, defaults.poll_interval),
            lock_dir: sched_file.lock_dir.map(PathBuf::from),
        };
        if scheduler.poll_interval.is_zero() {
            bail!("poll_interval_secs must be greater than 0");
        }
        if scheduler.lock_ttl <= scheduler.time_budget {
            bail!(
                "lock_ttl_secs ({}) must be greater than time_budget_secs ({})",
                scheduler.lock_ttl.as_secs(),
                scheduler.time_budget.as_secs()
            );
        }

        let jobs_file = file.jobs.unwrap_or_default();
        let job_defaults = JobsSettings::default();
        let jobs = JobsSettings {
            progress_max_age_days: jobs_file
                .progress_max_age_days
                .unwrap_or(job_defaults.progress_max_age_days),
            run_history_retention_days: jobs_file
                .run_history_retention_days
                .unwrap_or(job_defaults.run_history_retention_days),
            action_log_retention_days: jobs_file
                .action_log_retention_days
                .unwrap_or(job_defaults.action_log_retention_days),
            cleanup_batch_size: jobs_file
                .cleanup_batch_size
                .unwrap_or(job_defaults.cleanup_batch_size),
        };

        Ok(Self {
            db_dir,
            metrics_port,
            scheduler,
            jobs,
            tasks: file.tasks,
        })
    }

    pub fn engine_db_path(&self) -> PathBuf {
        self.db_dir.join("upkeep.db")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.scheduler
            .lock_dir
            .clone()
            .unwrap_or_else(|| self.db_dir.join("locks"))
    }

    pub fn global_settings(&self) -> GlobalSettings {
        GlobalSettings {
            scheduler_enabled: self.scheduler.enabled,
            preferred_hour: self.scheduler.preferred_hour,
            timezone: self.scheduler.timezone,
        }
    }

    /// Runtime-editable settings seeded from this configuration.
    pub fn settings_source(&self) -> ConfigSettings {
        ConfigSettings::new(self.global_settings(), self.tasks.clone())
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            default_time_budget: self.scheduler.time_budget,
            resume_delay: self.scheduler.resume_delay,
        }
    }
}

fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|e| anyhow!("Invalid timezone {:?}: {}", name, e))
}
