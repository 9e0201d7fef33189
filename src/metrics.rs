use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all engine metrics
const PREFIX: &str = "upkeep";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Task execution
    pub static ref TASK_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_task_executions_total"), "Task executions by outcome"),
        &["task_id", "status"]
    ).expect("Failed to create task_executions_total metric");

    pub static ref TASK_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_task_duration_seconds"),
            "Task run duration in seconds"
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0]),
        &["task_id"]
    ).expect("Failed to create task_duration_seconds metric");

    pub static ref TASK_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_task_running"), "Whether a task is currently running"),
        &["task_id"]
    ).expect("Failed to create task_running metric");

    // Scheduling
    pub static ref RECONCILE_CHANGES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_reconcile_changes_total"), "Schedule changes made by reconciliation"),
        &["change"]
    ).expect("Failed to create reconcile_changes_total metric");

    pub static ref TRIGGERS_DISPATCHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_triggers_dispatched_total"), "Due triggers dispatched to the registry"),
        &["backend"]
    ).expect("Failed to create triggers_dispatched_total metric");
}

/// Register all metrics with the Prometheus registry
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(TASK_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TASK_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(TASK_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(RECONCILE_CHANGES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TRIGGERS_DISPATCHED_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record a finished or skipped execution
pub fn record_task_execution(task_id: &str, status: &str, duration: Option<Duration>) {
    TASK_EXECUTIONS_TOTAL
        .with_label_values(&[task_id, status])
        .inc();

    if let Some(duration) = duration {
        TASK_DURATION_SECONDS
            .with_label_values(&[task_id])
            .observe(duration.as_secs_f64());
    }
}

pub fn set_task_running(task_id: &str, running: bool) {
    TASK_RUNNING
        .with_label_values(&[task_id])
        .set(if running { 1.0 } else { 0.0 });
}

pub fn record_reconcile_change(change: &str, count: usize) {
    if count > 0 {
        RECONCILE_CHANGES_TOTAL
            .with_label_values(&[change])
            .inc_by(count as f64);
    }
}

pub fn record_trigger_dispatched(backend: &str) {
    TRIGGERS_DISPATCHED_TOTAL
        .with_label_values(&[backend])
        .inc();
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_task_execution() {
        init_metrics();

        record_task_execution("metrics_test_task", "success", Some(Duration::from_millis(50)));
        record_task_execution("metrics_test_task", "skipped", None);

        let metrics = REGISTRY.gather();
        let executions = metrics
            .iter()
            .find(|m| m.get_name() == "upkeep_task_executions_total");
        assert!(executions.is_some(), "Execution metrics should exist");

        let durations = metrics
            .iter()
            .find(|m| m.get_name() == "upkeep_task_duration_seconds");
        assert!(durations.is_some(), "Duration metrics should exist");
    }

    #[test]
    fn test_reconcile_changes_skip_zero() {
        init_metrics();

        record_reconcile_change("metrics_test_change", 0);
        assert_eq!(
            RECONCILE_CHANGES_TOTAL
                .with_label_values(&["metrics_test_change"])
                .get(),
            0.0
        );

        record_reconcile_change("metrics_test_change", 3);
        assert_eq!(
            RECONCILE_CHANGES_TOTAL
                .with_label_values(&["metrics_test_change"])
                .get(),
            3.0
        );
    }
}
