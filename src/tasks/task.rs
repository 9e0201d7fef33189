use super::progress::ProgressStore;
use super::result::TaskResult;
use crate::scheduling::clock::Clock;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How often a task should be triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Disabled,
}

pub const DAY_SECS: u64 = 24 * 60 * 60;

impl Frequency {
    /// Interval between runs. Monthly is a fixed 30 days, not calendar months.
    pub fn interval_secs(&self) -> Option<u64> {
        match self {
            Frequency::Daily => Some(DAY_SECS),
            Frequency::Weekly => Some(7 * DAY_SECS),
            Frequency::Monthly => Some(30 * DAY_SECS),
            Frequency::Disabled => None,
        }
    }

    pub fn from_interval_secs(secs: u64) -> Option<Frequency> {
        [Frequency::Daily, Frequency::Weekly, Frequency::Monthly]
            .into_iter()
            .find(|f| f.interval_secs() == Some(secs))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Frequency> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Some(Frequency::Daily),
            "weekly" => Some(Frequency::Weekly),
            "monthly" => Some(Frequency::Monthly),
            "disabled" | "off" | "never" => Some(Frequency::Disabled),
            _ => None,
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Frequency::parse(s).ok_or_else(|| format!("unknown frequency '{}'", s))
    }
}

/// Errors a task body can return. Any of them turns into a failure result.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("Storage error: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),
}

impl TaskError {
    /// Key under which the error lands in the result's error map.
    pub fn error_key(&self) -> &'static str {
        match self {
            TaskError::Failed(_) => "run",
            TaskError::Store(_) => "store",
            TaskError::InvalidOptions(_) => "options",
        }
    }
}

/// Per-task configuration as seen by a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<Frequency>,
    /// Remaining task-specific keys.
    #[serde(flatten)]
    pub options: Map<String, JsonValue>,
}

impl TaskSettings {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Default::default()
        }
    }

    pub fn with_frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = Some(frequency);
        self
    }

    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(JsonValue::as_u64)
    }
}

/// What caused an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Schedule,
    Manual,
    Continuation,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSource::Schedule => write!(f, "schedule"),
            TriggerSource::Manual => write!(f, "manual"),
            TriggerSource::Continuation => write!(f, "continuation"),
        }
    }
}

/// Options for one execution.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub trigger: TriggerSource,
    /// Overrides the registry's default time budget.
    pub time_budget: Option<Duration>,
    /// Free-form parameters, e.g. from a manual trigger.
    pub params: JsonValue,
}

impl RunOptions {
    pub fn scheduled() -> Self {
        Self {
            trigger: TriggerSource::Schedule,
            time_budget: None,
            params: JsonValue::Null,
        }
    }

    pub fn manual() -> Self {
        Self {
            trigger: TriggerSource::Manual,
            ..Self::scheduled()
        }
    }

    pub fn continuation() -> Self {
        Self {
            trigger: TriggerSource::Continuation,
            ..Self::scheduled()
        }
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    pub fn with_params(mut self, params: JsonValue) -> Self {
        self.params = params;
        self
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::scheduled()
    }
}

/// Wall-clock budget for a single run.
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    started: Instant,
    limit: Duration,
}

/// Fraction of the budget that counts as "nearly exhausted".
const BUDGET_SAFETY_MARGIN: f64 = 0.2;

impl TimeBudget {
    pub fn new(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.elapsed())
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    /// True once less than a fifth of the budget is left. Tasks check this
    /// between units of work and checkpoint when it turns true.
    pub fn is_nearly_exhausted(&self) -> bool {
        self.remaining().as_secs_f64() <= self.limit.as_secs_f64() * BUDGET_SAFETY_MARGIN
    }
}

/// Everything a task gets to see while it runs.
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub progress: Arc<dyn ProgressStore>,
    pub settings: TaskSettings,
    pub budget: TimeBudget,
    resume_delay: Duration,
    clock: Arc<dyn Clock>,
}

impl TaskContext {
    pub fn new(
        task_id: &str,
        progress: Arc<dyn ProgressStore>,
        settings: TaskSettings,
        budget: TimeBudget,
        resume_delay: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            progress,
            settings,
            budget,
            resume_delay,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// When an interrupted run should be continued.
    pub fn resume_at(&self) -> DateTime<Utc> {
        let delay = ChronoDuration::from_std(self.resume_delay)
            .unwrap_or_else(|_| ChronoDuration::seconds(60));
        self.clock.now() + delay
    }

    pub fn should_yield(&self) -> bool {
        self.budget.is_nearly_exhausted()
    }
}

/// A unit of scheduled maintenance work.
///
/// `run` is called from a blocking context. Long runs should check
/// `ctx.should_yield()` between units of work, checkpoint with
/// `ctx.progress.save_interrupted(..)` and return
/// `TaskResult::interrupted(..)` instead of overrunning the budget.
pub trait MaintenanceTask: Send + Sync {
    /// Unique identifier, also used as the lock and dispatch key source.
    fn id(&self) -> &'static str;

    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn default_frequency(&self) -> Frequency;

    /// Whether configuration allows this task to run at all.
    fn is_enabled(&self, settings: &TaskSettings) -> bool {
        settings.enabled.unwrap_or(true)
    }

    /// JSON schema of the task-specific settings, if any.
    fn settings_schema(&self) -> Option<JsonValue> {
        None
    }

    fn run(&self, ctx: &TaskContext, options: &RunOptions) -> Result<TaskResult, TaskError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency_intervals() {
        assert_eq!(Frequency::Daily.interval_secs(), Some(86_400));
        assert_eq!(Frequency::Weekly.interval_secs(), Some(604_800));
        assert_eq!(Frequency::Monthly.interval_secs(), Some(2_592_000));
        assert_eq!(Frequency::Disabled.interval_secs(), None);
        assert_eq!(
            Frequency::from_interval_secs(604_800),
            Some(Frequency::Weekly)
        );
        assert_eq!(Frequency::from_interval_secs(3_600), None);
    }

    #[test]
    fn test_frequency_parse() {
        assert_eq!(Frequency::parse(" Daily "), Some(Frequency::Daily));
        assert_eq!("monthly".parse::<Frequency>(), Ok(Frequency::Monthly));
        assert!("fortnightly".parse::<Frequency>().is_err());
    }

    #[test]
    fn test_task_settings_deserialize_extra_keys() {
        let settings: TaskSettings = toml::from_str(
            r#"
            enabled = false
            frequency = "weekly"
            retention_days = 14
            "#,
        )
        .unwrap();

        assert_eq!(settings.enabled, Some(false));
        assert_eq!(settings.frequency, Some(Frequency::Weekly));
        assert_eq!(settings.option_u64("retention_days"), Some(14));
    }

    #[test]
    fn test_time_budget() {
        let budget = TimeBudget::new(Duration::from_secs(3600));
        assert!(!budget.is_nearly_exhausted());
        assert!(!budget.is_exhausted());

        let spent = TimeBudget::new(Duration::ZERO);
        assert!(spent.is_exhausted());
        assert!(spent.is_nearly_exhausted());
    }

    #[test]
    fn test_task_error_keys() {
        assert_eq!(TaskError::Failed("x".into()).error_key(), "run");
        assert_eq!(
            TaskError::from(anyhow::anyhow!("db gone")).error_key(),
            "store"
        );
    }
}
