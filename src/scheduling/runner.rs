//! Drives the active trigger backend: claims due triggers and dispatches them
//! through the registry.

use super::backend::{DueTrigger, TriggerBackend, TriggerBackends, TriggerOutcome};
use super::clock::Clock;
use crate::metrics;
use crate::tasks::registry::{ExecuteOutcome, TaskRegistry};
use crate::tasks::task::RunOptions;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default upper bound on how long the runner sleeps between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// What a single tick dispatched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub dispatched: usize,
    pub completed: usize,
    pub interrupted: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct TriggerRunner {
    registry: Arc<TaskRegistry>,
    backends: TriggerBackends,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    abandoned_after: Duration,
    shutdown_token: CancellationToken,
}

impl TriggerRunner {
    pub fn new(
        registry: Arc<TaskRegistry>,
        backends: TriggerBackends,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        shutdown_token: CancellationToken,
    ) -> Self {
        let abandoned_after = registry.locks().records().ttl();
        Self {
            registry,
            backends,
            clock,
            poll_interval,
            abandoned_after,
            shutdown_token,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Runs until the shutdown token is cancelled. A tick in progress is
    /// allowed to finish.
    pub async fn run(&self) {
        info!(
            "Trigger runner starting on {} backend",
            self.backends.active().kind()
        );
        self.recover_abandoned();

        loop {
            let sleep_duration = self.time_until_next_wakeup();
            debug!("Runner sleeping for {:?}", sleep_duration);

            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {
                    let summary = self.tick().await;
                    if summary.dispatched > 0 {
                        info!("Tick finished: {:?}", summary);
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Trigger runner shutting down");
                    break;
                }
            }
        }
    }

    fn recover_abandoned(&self) {
        let Ok(age) = chrono::Duration::from_std(self.abandoned_after) else {
            return;
        };
        let before = self.clock.now() - age;
        for backend in self.backends.all() {
            if let Err(e) = backend.recover_abandoned(before) {
                warn!("Failed to recover abandoned {} runs: {:#}", backend.kind(), e);
            }
        }
    }

    fn time_until_next_wakeup(&self) -> Duration {
        let next = match self.backends.active().next_wakeup() {
            Ok(next) => next,
            Err(e) => {
                warn!("Failed to read next wakeup: {:#}", e);
                None
            }
        };
        match next {
            Some(at) => until(self.clock.now(), at).min(self.poll_interval),
            None => self.poll_interval,
        }
    }

    /// Claims everything due now and runs it to completion.
    pub async fn tick(&self) -> TickSummary {
        let backend = self.backends.active().clone();
        let due = match backend.claim_due(self.clock.now()) {
            Ok(due) => due,
            Err(e) => {
                error!("Failed to claim due triggers: {:#}", e);
                return TickSummary::default();
            }
        };

        let mut summary = TickSummary {
            dispatched: due.len(),
            ..Default::default()
        };
        let mut handles = Vec::with_capacity(due.len());
        for trigger in due {
            metrics::record_trigger_dispatched(backend.kind().as_str());
            let registry = self.registry.clone();
            let backend = backend.clone();
            handles.push(tokio::spawn(dispatch(registry, backend, trigger)));
        }

        for handle in handles {
            match handle.await {
                Ok(TriggerOutcome::Completed) => summary.completed += 1,
                Ok(TriggerOutcome::Interrupted) => summary.interrupted += 1,
                Ok(TriggerOutcome::Skipped) => summary.skipped += 1,
                Ok(TriggerOutcome::Failed(_)) | Err(_) => summary.failed += 1,
            }
        }
        summary
    }
}

async fn dispatch(
    registry: Arc<TaskRegistry>,
    backend: Arc<dyn TriggerBackend>,
    trigger: DueTrigger,
) -> TriggerOutcome {
    let options = if trigger.recurring {
        RunOptions::scheduled()
    } else {
        RunOptions::continuation()
    };
    let key = trigger.dispatch_key.clone();
    let joined =
        tokio::task::spawn_blocking(move || registry.execute_dispatch(&key, options)).await;

    let outcome = match joined {
        Ok(Ok(ExecuteOutcome::Skipped)) => TriggerOutcome::Skipped,
        Ok(Ok(ExecuteOutcome::Completed(result))) => {
            if result.is_interrupted() {
                if let Some(next_run) = result.next_run() {
                    match backend.register_single(&trigger.dispatch_key, next_run) {
                        Ok(()) => debug!(
                            "Continuation for {} queued at {}",
                            trigger.dispatch_key, next_run
                        ),
                        Err(e) => error!(
                            "Failed to queue continuation for {}: {:#}",
                            trigger.dispatch_key, e
                        ),
                    }
                }
                TriggerOutcome::Interrupted
            } else if result.is_success() {
                TriggerOutcome::Completed
            } else {
                let message = result
                    .errors()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v))
                    .collect::<Vec<_>>()
                    .join("; ");
                TriggerOutcome::Failed(message)
            }
        }
        Ok(Err(e)) => {
            warn!("Dropping trigger {}: {}", trigger.dispatch_key, e);
            TriggerOutcome::Failed(e.to_string())
        }
        Err(e) => {
            error!("Dispatch of {} panicked: {}", trigger.dispatch_key, e);
            TriggerOutcome::Failed(format!("dispatch panicked: {}", e))
        }
    };

    if let Err(e) = backend.complete(&trigger, &outcome) {
        warn!(
            "Failed to report outcome for {}: {:#}",
            trigger.dispatch_key, e
        );
    }
    outcome
}

fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}
