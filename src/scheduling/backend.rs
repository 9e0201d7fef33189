//! The periodic-invocation primitive the engine registers schedules with.

use super::action_queue::ActionQueueBackend;
use super::clock::Clock;
use super::poller::PollerBackend;
use crate::engine_store::EngineDb;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("{backend} backend cannot schedule an interval of {interval_secs}s")]
    UnsupportedInterval {
        backend: BackendKind,
        interval_secs: u64,
    },

    #[error("Backend error: {0:#}")]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Poller,
    Queue,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Poller => "poller",
            BackendKind::Queue => "queue",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which backend to activate at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// The queue when the database supports it, the poller otherwise.
    #[default]
    Auto,
    Poller,
    Queue,
}

impl FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendPreference::Auto),
            "poller" => Ok(BackendPreference::Poller),
            "queue" => Ok(BackendPreference::Queue),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// How a backend describes a recurring registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recurrence {
    /// A named schedule such as `daily` or `twicedaily`.
    Named(String),
    /// An exact interval in seconds.
    Interval(u64),
}

/// A registration that became due and was claimed by this process.
#[derive(Debug, Clone, PartialEq)]
pub struct DueTrigger {
    pub dispatch_key: String,
    pub scheduled_for: DateTime<Utc>,
    /// Backend row id, for backends that track individual actions.
    pub action_id: Option<i64>,
    pub recurring: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Completed,
    Interrupted,
    Skipped,
    Failed(String),
}

pub trait TriggerBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Adds a recurring registration. Does not remove existing ones.
    fn register_recurring(
        &self,
        dispatch_key: &str,
        interval_secs: u64,
        first_run_at: DateTime<Utc>,
    ) -> Result<(), SchedulingError>;

    /// Adds a one-off registration.
    fn register_single(&self, dispatch_key: &str, at: DateTime<Utc>) -> Result<()>;

    /// Removes every pending registration for the key, returns how many.
    fn clear_all(&self, dispatch_key: &str) -> Result<usize>;

    /// Earliest pending run for the key, recurring or not.
    fn next_scheduled(&self, dispatch_key: &str) -> Result<Option<DateTime<Utc>>>;

    /// The recurring registration for the key, if any.
    fn recurrence(&self, dispatch_key: &str) -> Result<Option<Recurrence>>;

    /// Claims every registration due at `now`.
    fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<DueTrigger>>;

    fn complete(&self, trigger: &DueTrigger, outcome: &TriggerOutcome) -> Result<()>;

    /// Earliest pending run across all keys.
    fn next_wakeup(&self) -> Result<Option<DateTime<Utc>>>;

    /// Cleans up runs claimed before `before` that never completed.
    fn recover_abandoned(&self, _before: DateTime<Utc>) -> Result<usize> {
        Ok(0)
    }
}

/// The active backend plus every backend that may hold registrations.
#[derive(Clone)]
pub struct TriggerBackends {
    active: Arc<dyn TriggerBackend>,
    all: Vec<Arc<dyn TriggerBackend>>,
}

impl TriggerBackends {
    pub fn new(active: Arc<dyn TriggerBackend>, all: Vec<Arc<dyn TriggerBackend>>) -> Self {
        Self { active, all }
    }

    /// Probes the database once and picks the backend to activate.
    pub fn select(
        db: &EngineDb,
        preference: BackendPreference,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let poller: Arc<dyn TriggerBackend> =
            Arc::new(PollerBackend::new(db.clone(), clock.clone()));
        let queue_available = ActionQueueBackend::is_supported(db)?;

        if !queue_available {
            if preference == BackendPreference::Queue {
                warn!("Action queue requested but not supported by the database, using poller");
            }
            info!("Trigger backend: poller");
            return Ok(Self::new(poller.clone(), vec![poller]));
        }

        let queue: Arc<dyn TriggerBackend> = Arc::new(ActionQueueBackend::new(db.clone(), clock));
        let active = match preference {
            BackendPreference::Poller => poller.clone(),
            BackendPreference::Auto | BackendPreference::Queue => queue.clone(),
        };
        info!("Trigger backend: {}", active.kind());
        Ok(Self::new(active, vec![poller, queue]))
    }

    pub fn active(&self) -> &Arc<dyn TriggerBackend> {
        &self.active
    }

    pub fn all(&self) -> &[Arc<dyn TriggerBackend>] {
        &self.all
    }
}
