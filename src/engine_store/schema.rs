//! SQLite schema definitions for the engine database.
//!
//! The engine keeps lock records, task checkpoints, trigger registrations and
//! the result log in a single database file.

use crate::sqlite_column;
use crate::sqlite_persistence::{SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Locks, checkpoints, poller events and run log
// =============================================================================

/// Fallback lock records, one row per held lock.
pub const TASK_LOCKS_TABLE_V1: Table = Table {
    name: "task_locks",
    columns: &[
        sqlite_column!("name", &SqlType::Text, is_primary_key = true),
        sqlite_column!("holder", &SqlType::Text, non_null = true),
        sqlite_column!("acquired_at", &SqlType::Integer, non_null = true),
        sqlite_column!("ttl_secs", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
};

/// Task checkpoints. `payload` is a JSON object.
pub const TASK_PROGRESS_TABLE_V1: Table = Table {
    name: "task_progress",
    columns: &[
        sqlite_column!("task_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("payload", &SqlType::Text, non_null = true),
        sqlite_column!("saved_at", &SqlType::Integer, non_null = true),
        sqlite_column!("interrupted_at", &SqlType::Integer),
    ],
    indices: &[("idx_task_progress_saved_at", "saved_at")],
};

/// Poller backend registrations. `schedule` is NULL for single events.
pub const POLLER_EVENTS_TABLE_V1: Table = Table {
    name: "poller_events",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("hook", &SqlType::Text, non_null = true),
        sqlite_column!("schedule", &SqlType::Text),
        sqlite_column!("interval_secs", &SqlType::Integer),
        sqlite_column!("next_run_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_poller_events_hook", "hook"),
        ("idx_poller_events_next_run", "next_run_at"),
    ],
};

/// One row per produced TaskResult.
pub const TASK_RUNS_TABLE_V1: Table = Table {
    name: "task_runs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("task_id", &SqlType::Text, non_null = true),
        sqlite_column!("executed_at", &SqlType::Integer, non_null = true),
        sqlite_column!("success", &SqlType::Integer, non_null = true),
        sqlite_column!("interrupted", &SqlType::Integer, non_null = true),
        sqlite_column!("items_found", &SqlType::Integer, non_null = true),
        sqlite_column!("items_cleaned", &SqlType::Integer, non_null = true),
        sqlite_column!("bytes_freed", &SqlType::Integer, non_null = true),
        sqlite_column!("elapsed_time", &SqlType::Real, non_null = true),
        sqlite_column!("record", &SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_task_runs_task_id_executed", "task_id, executed_at DESC"),
        ("idx_task_runs_executed_at", "executed_at"),
    ],
};

// =============================================================================
// Version 2 - Action queue
// =============================================================================

/// Action queue backend rows. Recurring actions carry `interval_secs` and are
/// requeued as a fresh pending row when claimed.
pub const QUEUED_ACTIONS_TABLE_V2: Table = Table {
    name: "queued_actions",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("hook", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("scheduled_at", &SqlType::Integer, non_null = true),
        sqlite_column!("interval_secs", &SqlType::Integer),
        sqlite_column!("claimed_at", &SqlType::Integer),
        sqlite_column!("finished_at", &SqlType::Integer),
        sqlite_column!("message", &SqlType::Text),
    ],
    indices: &[
        ("idx_queued_actions_hook_status", "hook, status"),
        ("idx_queued_actions_status_scheduled", "status, scheduled_at"),
    ],
};

/// Migration from version 1 to version 2: add the action queue
fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    QUEUED_ACTIONS_TABLE_V2.create(conn)
}

// =============================================================================
// Versioned Schema Definition
// =============================================================================

/// All versioned schemas for the engine database.
///
/// Version 1: locks, checkpoints, poller events, run log
/// Version 2: action queue
pub const ENGINE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[
            TASK_LOCKS_TABLE_V1,
            TASK_PROGRESS_TABLE_V1,
            POLLER_EVENTS_TABLE_V1,
            TASK_RUNS_TABLE_V1,
        ],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[
            TASK_LOCKS_TABLE_V1,
            TASK_PROGRESS_TABLE_V1,
            POLLER_EVENTS_TABLE_V1,
            TASK_RUNS_TABLE_V1,
            QUEUED_ACTIONS_TABLE_V2,
        ],
        migration: Some(migrate_v1_to_v2),
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            [name],
            |r| r.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn test_v1_schema_creates_successfully() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = &ENGINE_VERSIONED_SCHEMAS[0];
        schema.create(&conn).unwrap();
        schema.validate(&conn).unwrap();
        assert!(!table_exists(&conn, "queued_actions"));
    }

    #[test]
    fn test_v2_schema_creates_successfully() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = &ENGINE_VERSIONED_SCHEMAS[1];
        schema.create(&conn).unwrap();
        schema.validate(&conn).unwrap();
        assert!(table_exists(&conn, "queued_actions"));
    }

    #[test]
    fn test_migration_v1_to_v2() {
        let conn = Connection::open_in_memory().unwrap();
        ENGINE_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        if let Some(migrate_fn) = ENGINE_VERSIONED_SCHEMAS[1].migration {
            migrate_fn(&conn).unwrap();
        }

        assert!(table_exists(&conn, "queued_actions"));
        ENGINE_VERSIONED_SCHEMAS[1].validate(&conn).unwrap();
    }
}
