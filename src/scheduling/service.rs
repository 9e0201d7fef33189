//! Keeps trigger-backend registrations in line with configuration.
//!
//! The backend is the only record of what is scheduled: frequencies and next
//! run times are read back from it rather than cached here.

use super::backend::{Recurrence, SchedulingError, TriggerBackends};
use super::clock::Clock;
use super::poller::schedule_interval;
use crate::metrics;
use crate::tasks::registry::{dispatch_key, TaskDefinitionInfo, TaskRegistry};
use crate::tasks::task::Frequency;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub scheduled: Vec<String>,
    pub unscheduled: Vec<String>,
    pub rescheduled: Vec<String>,
    pub unchanged: Vec<String>,
    pub errors: BTreeMap<String, String>,
}

impl ReconcileReport {
    /// True when nothing was added, removed or changed.
    pub fn is_noop(&self) -> bool {
        self.scheduled.is_empty() && self.unscheduled.is_empty() && self.rescheduled.is_empty()
    }
}

enum Change {
    Scheduled,
    Unscheduled,
    Rescheduled,
    Unchanged,
}

pub struct SchedulingService {
    registry: Arc<TaskRegistry>,
    backends: TriggerBackends,
    clock: Arc<dyn Clock>,
}

impl SchedulingService {
    pub fn new(
        registry: Arc<TaskRegistry>,
        backends: TriggerBackends,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            backends,
            clock,
        }
    }

    pub fn backends(&self) -> &TriggerBackends {
        &self.backends
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    fn ensure_known(&self, task_id: &str) -> Result<(), SchedulingError> {
        if self.registry.contains(task_id) {
            Ok(())
        } else {
            Err(SchedulingError::UnknownTask(task_id.to_string()))
        }
    }

    /// Replaces the task's registrations with a single recurring one.
    /// `Disabled` unschedules. Without `next_run`, the first run is the next
    /// preferred hour.
    pub fn schedule(
        &self,
        task_id: &str,
        frequency: Frequency,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), SchedulingError> {
        self.ensure_known(task_id)?;
        let Some(interval_secs) = frequency.interval_secs() else {
            self.unschedule(task_id)?;
            return Ok(());
        };

        let key = dispatch_key(task_id);
        for backend in self.backends.all() {
            backend.clear_all(&key)?;
        }
        let first_run_at = next_run.unwrap_or_else(|| self.calculate_next_run_time(None));
        self.backends
            .active()
            .register_recurring(&key, interval_secs, first_run_at)?;
        info!(
            "Scheduled {} {} starting {}",
            task_id, frequency, first_run_at
        );
        Ok(())
    }

    /// Removes every registration for the task from every backend. Returns how
    /// many were removed; zero is not an error.
    pub fn unschedule(&self, task_id: &str) -> Result<usize, SchedulingError> {
        let key = dispatch_key(task_id);
        let mut removed = 0;
        for backend in self.backends.all() {
            removed += backend.clear_all(&key)?;
        }
        if removed > 0 {
            info!("Unscheduled {} ({} registrations removed)", task_id, removed);
        }
        Ok(removed)
    }

    /// Brings every registered task's schedule in line with configuration.
    ///
    /// Not reentrant: run it from one place at a time.
    pub fn reconcile(&self) -> ReconcileReport {
        let global = self.registry.settings().global();
        let mut report = ReconcileReport::default();

        for task_id in self.registry.ids() {
            let change = if global.scheduler_enabled {
                self.reconcile_task(&task_id)
            } else {
                self.unschedule(&task_id).map(|removed| {
                    if removed > 0 {
                        Change::Unscheduled
                    } else {
                        Change::Unchanged
                    }
                })
            };
            match change {
                Ok(Change::Scheduled) => report.scheduled.push(task_id),
                Ok(Change::Unscheduled) => report.unscheduled.push(task_id),
                Ok(Change::Rescheduled) => report.rescheduled.push(task_id),
                Ok(Change::Unchanged) => report.unchanged.push(task_id),
                Err(e) => {
                    warn!("Failed to reconcile {}: {}", task_id, e);
                    report.errors.insert(task_id, e.to_string());
                }
            }
        }

        metrics::record_reconcile_change("scheduled", report.scheduled.len());
        metrics::record_reconcile_change("unscheduled", report.unscheduled.len());
        metrics::record_reconcile_change("rescheduled", report.rescheduled.len());
        info!(
            "Reconciled schedules: {} scheduled, {} unscheduled, {} rescheduled, {} unchanged, {} errors",
            report.scheduled.len(),
            report.unscheduled.len(),
            report.rescheduled.len(),
            report.unchanged.len(),
            report.errors.len()
        );
        report
    }

    fn reconcile_task(&self, task_id: &str) -> Result<Change, SchedulingError> {
        let task = self
            .registry
            .get(task_id)
            .ok_or_else(|| SchedulingError::UnknownTask(task_id.to_string()))?;
        let settings = self.registry.settings().task(task_id);
        let desired = self.registry.effective_frequency(task.as_ref());
        let wanted = task.is_enabled(&settings) && desired != Frequency::Disabled;

        let key = dispatch_key(task_id);
        let recurrence = self.backends.active().recurrence(&key)?;

        match (wanted, recurrence) {
            (true, None) => {
                self.schedule(task_id, desired, None)?;
                Ok(Change::Scheduled)
            }
            (true, Some(recurrence)) => {
                if normalize_recurrence(&recurrence) == Some(desired) {
                    Ok(Change::Unchanged)
                } else {
                    debug!(
                        "{} is scheduled as {:?}, wants {}",
                        task_id, recurrence, desired
                    );
                    self.schedule(task_id, desired, None)?;
                    Ok(Change::Rescheduled)
                }
            }
            (false, _) => {
                if self.unschedule(task_id)? > 0 {
                    Ok(Change::Unscheduled)
                } else {
                    Ok(Change::Unchanged)
                }
            }
        }
    }

    /// Next occurrence of `preferred_hour` (clamped to 0-23, default from
    /// global settings) in the configured timezone, strictly after now.
    pub fn calculate_next_run_time(&self, preferred_hour: Option<i32>) -> DateTime<Utc> {
        let global = self.registry.settings().global();
        let hour = preferred_hour
            .unwrap_or(global.preferred_hour)
            .clamp(0, 23) as u32;
        next_occurrence_of_hour(self.clock.now(), hour, global.timezone)
    }

    /// Frequency the task is currently scheduled with on the active backend.
    /// `None` if it is not scheduled or the backend's recurrence has no
    /// matching frequency.
    pub fn get_frequency(&self, task_id: &str) -> Result<Option<Frequency>, SchedulingError> {
        self.ensure_known(task_id)?;
        let Some(recurrence) = self.backends.active().recurrence(&dispatch_key(task_id))? else {
            return Ok(None);
        };
        let frequency = normalize_recurrence(&recurrence);
        if frequency.is_none() {
            warn!(
                "{} has a recurrence with no matching frequency: {:?}",
                task_id, recurrence
            );
        }
        Ok(frequency)
    }

    pub fn next_run(&self, task_id: &str) -> Result<Option<DateTime<Utc>>, SchedulingError> {
        self.ensure_known(task_id)?;
        Ok(self
            .backends
            .active()
            .next_scheduled(&dispatch_key(task_id))?)
    }

    pub fn task_definitions(&self) -> Vec<TaskDefinitionInfo> {
        self.registry
            .get_task_definitions(self.backends.active().as_ref())
    }
}

fn normalize_recurrence(recurrence: &Recurrence) -> Option<Frequency> {
    let secs = match recurrence {
        Recurrence::Named(name) => schedule_interval(name)?,
        Recurrence::Interval(secs) => *secs,
    };
    Frequency::from_interval_secs(secs)
}

fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

/// `hour:00` local on `date`, or one hour later when that wall-clock time
/// falls in a gap. The later time may land on the following day.
fn local_hour(tz: Tz, date: NaiveDate, hour: u32) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(hour, 0, 0)?;
    resolve_local(tz, naive).or_else(|| {
        naive
            .checked_add_signed(Duration::hours(1))
            .and_then(|later| resolve_local(tz, later))
    })
}

/// `hour:00` local time today if still ahead of `now`, else the next day that
/// has it. A wall-clock hour skipped by a DST change moves one hour later.
fn next_occurrence_of_hour(now: DateTime<Utc>, hour: u32, tz: Tz) -> DateTime<Utc> {
    let today = now.with_timezone(&tz).date_naive();
    let mut date = today;
    for _ in 0..3 {
        if let Some(candidate) = local_hour(tz, date, hour) {
            if candidate > now {
                return candidate;
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }
    now + Duration::days(1)
}
