use super::schema::ENGINE_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to the engine database.
///
/// Cloning is cheap; every clone talks to the same connection.
#[derive(Clone)]
pub struct EngineDb {
    conn: Arc<Mutex<Connection>>,
}

impl EngineDb {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let is_new_db = !path.exists();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {:?}", parent)
                })?;
            }
        }

        let mut conn = Connection::open(path).context("Failed to open engine database")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        if is_new_db {
            info!("Creating new engine database at {:?}", path);
            Self::create_latest(&conn)?;
        } else {
            let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
            let db_version = raw_version - BASE_DB_VERSION as i64;

            if db_version < 1 {
                anyhow::bail!(
                    "Engine database version {} is invalid (expected >= 1)",
                    db_version
                );
            }

            let current_schema_version = Self::latest_version() as i64;

            let version_index = ENGINE_VERSIONED_SCHEMAS
                .iter()
                .position(|s| s.version == db_version as usize)
                .with_context(|| format!("Unknown engine database version {}", db_version))?;
            ENGINE_VERSIONED_SCHEMAS[version_index]
                .validate(&conn)
                .with_context(|| {
                    format!(
                        "Engine database schema validation failed for version {}",
                        db_version
                    )
                })?;

            if db_version < current_schema_version {
                info!(
                    "Migrating engine database from version {} to {}",
                    db_version, current_schema_version
                );
                Self::migrate_if_needed(&mut conn, db_version as usize)?;
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Fresh database that lives as long as the handle. Used by tests and
    /// one-shot CLI invocations.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::create_latest(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn latest_version() -> usize {
        ENGINE_VERSIONED_SCHEMAS
            .last()
            .map(|schema| schema.version)
            .unwrap_or(0)
    }

    fn create_latest(conn: &Connection) -> Result<()> {
        let schema = ENGINE_VERSIONED_SCHEMAS
            .last()
            .context("No engine schema defined")?;
        schema.create(conn)
    }

    fn migrate_if_needed(conn: &mut Connection, from_version: usize) -> Result<()> {
        let tx = conn.transaction()?;
        let mut latest_from = from_version;
        for schema in ENGINE_VERSIONED_SCHEMAS.iter().skip(from_version) {
            if schema.version > from_version {
                info!(
                    "Running engine database migration from version {} to {}",
                    latest_from, schema.version
                );
                if let Some(migration_fn) = schema.migration {
                    migration_fn(&tx).with_context(|| {
                        format!("Failed to run migration to version {}", schema.version)
                    })?;
                }
                latest_from = schema.version;
            }
        }
        tx.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + latest_from),
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    pub fn schema_version(&self) -> Result<usize> {
        let raw_version: i64 = self
            .conn()
            .query_row("PRAGMA user_version;", [], |row| row.get(0))?;
        Ok((raw_version - BASE_DB_VERSION as i64).max(0) as usize)
    }

    pub fn has_table(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

/// Timestamps are stored as Unix milliseconds.
pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
