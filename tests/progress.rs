mod common;

use chrono::Duration;
use common::{engine, ProbeTask};
use serde_json::json;
use upkeep_engine::tasks::progress::{
    Checkpoint, ProgressStore, COMPLETED_TASKS_KEY, INTERRUPTED_AT_KEY, SAVED_AT_KEY,
};
use upkeep_engine::tasks::task::{Frequency, RunOptions};

fn checkpoint(offset: i64) -> Checkpoint {
    let mut data = Checkpoint::new();
    data.insert("offset".to_string(), json!(offset));
    data
}

#[test]
fn test_save_interrupted_load_and_clear() {
    let t = engine();
    let progress = t.engine.progress();

    progress.save_interrupted("audit", &checkpoint(42)).unwrap();

    let loaded = progress.load("audit").unwrap();
    assert_eq!(loaded.get("offset"), Some(&json!(42)));
    assert!(loaded.contains_key(SAVED_AT_KEY));
    assert!(loaded.contains_key(INTERRUPTED_AT_KEY));
    assert!(progress.has_progress("audit").unwrap());

    assert!(progress.clear("audit").unwrap());
    assert!(progress.load("audit").unwrap().is_empty());
    assert!(!progress.has_progress("audit").unwrap());
    assert!(!progress.clear("audit").unwrap());
}

#[test]
fn test_helpers_accumulate_into_checkpoint() {
    let t = engine();
    let progress = t.engine.progress();

    assert_eq!(progress.increment("audit", "processed", 5).unwrap(), 5);
    assert_eq!(progress.increment("audit", "processed", 3).unwrap(), 8);
    progress.add_completed_task("audit", "albums").unwrap();
    progress.add_completed_task("audit", "albums").unwrap();
    progress.add_completed_task("audit", "tracks").unwrap();

    let loaded = progress.load("audit").unwrap();
    assert_eq!(loaded.get("processed"), Some(&json!(8)));
    assert_eq!(
        loaded.get(COMPLETED_TASKS_KEY),
        Some(&json!(["albums", "tracks"]))
    );
}

#[test]
fn test_staleness_follows_the_clock() {
    let t = engine();
    let progress = t.engine.progress();
    progress.save("audit", &checkpoint(1)).unwrap();

    assert!(!progress.is_stale("audit", Duration::hours(1)).unwrap());
    t.clock.advance(Duration::hours(2));
    assert!(progress.is_stale("audit", Duration::hours(1)).unwrap());
    assert!(progress.is_stale("never-saved", Duration::hours(1)).unwrap());

    assert_eq!(progress.prune_stale(Duration::hours(1)).unwrap(), 1);
    assert!(!progress.has_progress("audit").unwrap());
}

#[test]
fn test_successful_run_clears_leftover_checkpoint() {
    let t = engine();
    let task = ProbeTask::new("audit", Frequency::Weekly);
    t.engine.registry().register(task.clone());
    t.engine
        .progress()
        .save_interrupted("audit", &checkpoint(7))
        .unwrap();

    let outcome = t
        .engine
        .registry()
        .execute("audit", RunOptions::manual())
        .unwrap();

    assert!(outcome.result().unwrap().is_success());
    assert!(!t.engine.progress().has_progress("audit").unwrap());
}
