use crate::tasks::task::{Frequency, TaskSettings};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::RwLock;

pub const DEFAULT_PREFERRED_HOUR: i32 = 3;

/// Engine-wide scheduling settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSettings {
    /// When false, reconciliation removes every schedule.
    pub scheduler_enabled: bool,
    /// Hour of day (0-23, in `timezone`) recurring runs start at.
    pub preferred_hour: i32,
    pub timezone: Tz,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            scheduler_enabled: true,
            preferred_hour: DEFAULT_PREFERRED_HOUR,
            timezone: Tz::UTC,
        }
    }
}

/// Desired configuration, read on every reconciliation and execution.
pub trait SettingsSource: Send + Sync {
    fn global(&self) -> GlobalSettings;

    /// Settings for one task; defaults when the task is not configured.
    fn task(&self, task_id: &str) -> TaskSettings;
}

/// In-memory settings seeded from the config file and editable at runtime.
#[derive(Debug, Default)]
pub struct ConfigSettings {
    global: RwLock<GlobalSettings>,
    tasks: RwLock<HashMap<String, TaskSettings>>,
}

impl ConfigSettings {
    pub fn new(global: GlobalSettings, tasks: HashMap<String, TaskSettings>) -> Self {
        Self {
            global: RwLock::new(global),
            tasks: RwLock::new(tasks),
        }
    }

    pub fn set_global(&self, global: GlobalSettings) {
        *self.global.write().unwrap() = global;
    }

    pub fn set_scheduler_enabled(&self, enabled: bool) {
        self.global.write().unwrap().scheduler_enabled = enabled;
    }

    pub fn set_task(&self, task_id: &str, settings: TaskSettings) {
        self.tasks
            .write()
            .unwrap()
            .insert(task_id.to_string(), settings);
    }

    pub fn set_task_enabled(&self, task_id: &str, enabled: bool) {
        let mut tasks = self.tasks.write().unwrap();
        tasks.entry(task_id.to_string()).or_default().enabled = Some(enabled);
    }

    pub fn set_task_frequency(&self, task_id: &str, frequency: Frequency) {
        let mut tasks = self.tasks.write().unwrap();
        tasks.entry(task_id.to_string()).or_default().frequency = Some(frequency);
    }
}

impl SettingsSource for ConfigSettings {
    fn global(&self) -> GlobalSettings {
        self.global.read().unwrap().clone()
    }

    fn task(&self, task_id: &str) -> TaskSettings {
        self.tasks
            .read()
            .unwrap()
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_task_gets_defaults() {
        let settings = ConfigSettings::default();
        assert_eq!(settings.task("x"), TaskSettings::default());
        assert!(settings.global().scheduler_enabled);
        assert_eq!(settings.global().preferred_hour, DEFAULT_PREFERRED_HOUR);
    }

    #[test]
    fn test_runtime_updates() {
        let settings = ConfigSettings::default();
        settings.set_task_enabled("x", false);
        settings.set_task_frequency("x", Frequency::Monthly);
        settings.set_scheduler_enabled(false);

        let task = settings.task("x");
        assert_eq!(task.enabled, Some(false));
        assert_eq!(task.frequency, Some(Frequency::Monthly));
        assert!(!settings.global().scheduler_enabled);
    }
}
