use crate::tasks::task::TaskSettings;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub metrics_port: Option<u16>,

    pub scheduler: Option<SchedulerConfig>,
    pub jobs: Option<JobsConfig>,
    /// `[tasks.<task_id>]` tables.
    pub tasks: HashMap<String, TaskSettings>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: Option<bool>,
    pub preferred_hour: Option<i32>,
    /// IANA name, e.g. "Europe/Rome".
    pub timezone: Option<String>,
    /// "auto", "poller" or "queue".
    pub backend: Option<String>,
    pub lock_ttl_secs: Option<u64>,
    pub time_budget_secs: Option<u64>,
    pub resume_delay_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub lock_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct JobsConfig {
    pub progress_max_age_days: Option<u64>,
    pub run_history_retention_days: Option<u64>,
    pub action_log_retention_days: Option<u64>,
    pub cleanup_batch_size: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}
