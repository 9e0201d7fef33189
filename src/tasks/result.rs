//! Normalized outcome of a single task execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Error key used when a failure is constructed without any error entries.
pub const DEFAULT_ERROR_KEY: &str = "task";

/// Work counters carried by a result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub items_found: u64,
    pub items_cleaned: u64,
    pub bytes_freed: u64,
}

impl Counts {
    pub fn new(items_found: u64, items_cleaned: u64, bytes_freed: u64) -> Self {
        Self {
            items_found,
            items_cleaned,
            bytes_freed,
        }
    }

    pub fn found(items_found: u64) -> Self {
        Self {
            items_found,
            ..Self::default()
        }
    }

    pub fn saturating_add(self, other: Counts) -> Counts {
        Counts {
            items_found: self.items_found.saturating_add(other.items_found),
            items_cleaned: self.items_cleaned.saturating_add(other.items_cleaned),
            bytes_freed: self.bytes_freed.saturating_add(other.bytes_freed),
        }
    }
}

/// Field replacements for [`TaskResult::with`]. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct ResultUpdate {
    pub items_found: Option<u64>,
    pub items_cleaned: Option<u64>,
    pub bytes_freed: Option<u64>,
    /// Only applied to interrupted results.
    pub next_run: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub elapsed_time: Option<f64>,
}

/// What happened during one execution of a task.
///
/// Exactly one of three shapes: success, failure (`success == false`, at least
/// one error) or interrupted (`success == true`, `interrupted == true`, with an
/// optional `next_run`). Values are never mutated; the updaters return copies.
///
/// The serialized field names are consumed by dashboards and log processors and
/// must stay stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    success: bool,
    items_found: u64,
    items_cleaned: u64,
    bytes_freed: u64,
    errors: BTreeMap<String, String>,
    interrupted: bool,
    next_run: Option<DateTime<Utc>>,
    task_id: String,
    executed_at: DateTime<Utc>,
    elapsed_time: f64,
}

impl TaskResult {
    fn base(task_id: &str, counts: Counts) -> Self {
        Self {
            success: true,
            items_found: counts.items_found,
            items_cleaned: counts.items_cleaned,
            bytes_freed: counts.bytes_freed,
            errors: BTreeMap::new(),
            interrupted: false,
            next_run: None,
            task_id: task_id.to_string(),
            executed_at: Utc::now(),
            elapsed_time: 0.0,
        }
    }

    pub fn success(task_id: &str, counts: Counts) -> Self {
        Self::base(task_id, counts)
    }

    /// A failed run. An empty error map is replaced by a single generic entry
    /// so that a failure always reports at least one error.
    pub fn failure(task_id: &str, errors: BTreeMap<String, String>) -> Self {
        let mut result = Self::base(task_id, Counts::default());
        result.success = false;
        result.errors = errors;
        if result.errors.is_empty() {
            result
                .errors
                .insert(DEFAULT_ERROR_KEY.to_string(), "task failed".to_string());
        }
        result
    }

    /// Shorthand for a failure with a single error entry.
    pub fn from_error(task_id: &str, key: &str, message: impl Into<String>) -> Self {
        let mut errors = BTreeMap::new();
        errors.insert(key.to_string(), message.into());
        Self::failure(task_id, errors)
    }

    /// A run that stopped early after checkpointing. `next_run` is when the
    /// continuation should fire.
    pub fn interrupted(task_id: &str, counts: Counts, next_run: Option<DateTime<Utc>>) -> Self {
        let mut result = Self::base(task_id, counts);
        result.interrupted = true;
        result.next_run = next_run;
        result
    }

    /// Returns a copy with the given fields replaced. The success and
    /// interrupted flags are fixed by the constructor and cannot change here.
    pub fn with(&self, update: ResultUpdate) -> Self {
        let mut result = self.clone();
        if let Some(items_found) = update.items_found {
            result.items_found = items_found;
        }
        if let Some(items_cleaned) = update.items_cleaned {
            result.items_cleaned = items_cleaned;
        }
        if let Some(bytes_freed) = update.bytes_freed {
            result.bytes_freed = bytes_freed;
        }
        if let Some(next_run) = update.next_run {
            if result.interrupted {
                result.next_run = Some(next_run);
            }
        }
        if let Some(executed_at) = update.executed_at {
            result.executed_at = executed_at;
        }
        if let Some(elapsed_time) = update.elapsed_time {
            result.elapsed_time = elapsed_time.max(0.0);
        }
        result
    }

    /// Returns a copy with the counters increased by `counts`.
    pub fn add_counts(&self, counts: Counts) -> Self {
        let total = self.counts().saturating_add(counts);
        let mut result = self.clone();
        result.items_found = total.items_found;
        result.items_cleaned = total.items_cleaned;
        result.bytes_freed = total.bytes_freed;
        result
    }

    /// Returns a copy with one more error entry. Does not flip the success flag:
    /// a successful run may still report non-fatal errors.
    pub fn add_error(&self, key: &str, message: impl Into<String>) -> Self {
        let mut result = self.clone();
        result.errors.insert(key.to_string(), message.into());
        result
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn counts(&self) -> Counts {
        Counts {
            items_found: self.items_found,
            items_cleaned: self.items_cleaned,
            bytes_freed: self.bytes_freed,
        }
    }

    pub fn items_found(&self) -> u64 {
        self.items_found
    }

    pub fn items_cleaned(&self) -> u64 {
        self.items_cleaned
    }

    pub fn bytes_freed(&self) -> u64 {
        self.bytes_freed
    }

    pub fn errors(&self) -> &BTreeMap<String, String> {
        &self.errors
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.next_run
    }

    pub fn executed_at(&self) -> DateTime<Utc> {
        self.executed_at
    }

    /// Seconds the run took.
    pub fn elapsed_time(&self) -> f64 {
        self.elapsed_time
    }

    /// Short label used for metrics and log lines.
    pub fn status(&self) -> &'static str {
        if !self.success {
            "failure"
        } else if self.interrupted {
            "interrupted"
        } else {
            "success"
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: found={} cleaned={} freed={:#} errors={} elapsed={:.2}s",
            self.task_id,
            self.status(),
            self.items_found,
            self.items_cleaned,
            byte_unit::Byte::from(self.bytes_freed),
            self.errors.len(),
            self.elapsed_time
        )
    }
}
