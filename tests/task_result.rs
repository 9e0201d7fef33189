use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use upkeep_engine::tasks::result::{Counts, ResultUpdate, TaskResult, DEFAULT_ERROR_KEY};

#[test]
fn test_success_has_no_errors_and_is_not_interrupted() {
    let result = TaskResult::success("audit", Counts::new(10, 4, 2048));
    assert!(result.is_success());
    assert!(!result.has_errors());
    assert!(!result.is_interrupted());
    assert_eq!(result.next_run(), None);
    assert_eq!(result.status(), "success");
}

#[test]
fn test_failure_always_reports_an_error() {
    let result = TaskResult::failure("audit", BTreeMap::new());
    assert!(!result.is_success());
    assert!(result.errors().contains_key(DEFAULT_ERROR_KEY));
    assert_eq!(result.status(), "failure");

    let result = TaskResult::from_error("audit", "db", "locked");
    assert_eq!(result.errors().get("db").map(String::as_str), Some("locked"));
}

#[test]
fn test_interrupted_carries_next_run() {
    let at = Utc.with_ymd_and_hms(2025, 3, 10, 10, 1, 0).unwrap();
    let result = TaskResult::interrupted("audit", Counts::found(3), Some(at));
    assert!(result.is_success());
    assert!(result.is_interrupted());
    assert_eq!(result.next_run(), Some(at));
    assert_eq!(result.status(), "interrupted");
}

#[test]
fn test_updates_return_copies() {
    let original = TaskResult::success("audit", Counts::new(1, 1, 10));
    let at = Utc.with_ymd_and_hms(2025, 3, 10, 10, 0, 0).unwrap();

    let updated = original
        .with(ResultUpdate {
            items_found: Some(5),
            next_run: Some(at),
            elapsed_time: Some(-1.0),
            ..Default::default()
        })
        .add_counts(Counts::new(1, 2, 30))
        .add_error("warning", "slow disk");

    assert_eq!(original.items_found(), 1);
    assert!(!original.has_errors());

    assert_eq!(updated.items_found(), 6);
    assert_eq!(updated.items_cleaned(), 3);
    assert_eq!(updated.bytes_freed(), 40);
    // next_run only sticks on interrupted results.
    assert_eq!(updated.next_run(), None);
    assert_eq!(updated.elapsed_time(), 0.0);
    // Non-fatal errors do not flip success.
    assert!(updated.is_success());
    assert!(updated.has_errors());
}

#[test]
fn test_serialized_field_names_are_stable() {
    let result = TaskResult::success("audit", Counts::new(2, 1, 512));
    let json = result.to_json();
    let keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
    for key in [
        "success",
        "items_found",
        "items_cleaned",
        "bytes_freed",
        "errors",
        "interrupted",
        "next_run",
        "task_id",
        "executed_at",
        "elapsed_time",
    ] {
        assert!(keys.contains(&key), "missing {}", key);
    }

    let back: TaskResult = serde_json::from_value(json).unwrap();
    assert_eq!(back, result);
}
