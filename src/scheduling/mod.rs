//! Turning configuration into trigger registrations, and triggers into runs.

pub mod action_queue;
pub mod backend;
pub mod clock;
pub mod poller;
pub mod runner;
pub mod service;
pub mod settings;

pub use action_queue::{ActionQueueBackend, ActionStatus, QueuedAction};
pub use backend::{
    BackendKind, BackendPreference, DueTrigger, Recurrence, SchedulingError, TriggerBackend,
    TriggerBackends, TriggerOutcome,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use poller::PollerBackend;
pub use runner::{TickSummary, TriggerRunner};
pub use service::{ReconcileReport, SchedulingService};
pub use settings::{ConfigSettings, GlobalSettings, SettingsSource};
