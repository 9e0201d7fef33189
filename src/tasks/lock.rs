//! Per-task mutual exclusion.
//!
//! The primary strategy is an OS advisory lock (`flock`) on a file named after
//! a hash of the task id. When that primitive is unavailable the manager falls
//! back to a create-if-absent row in the `task_locks` table, with a TTL so that
//! a record left behind by a crashed holder can be taken over.

use crate::engine_store::{from_millis, EngineDb};
use crate::scheduling::clock::{Clock, SystemClock};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

const LOCK_NAME_PREFIX: &str = "upkeep_lock_";

/// Deterministic lock name for a task id.
pub fn lock_name(task_id: &str) -> String {
    let hex = format!("{:x}", Sha256::digest(task_id.as_bytes()));
    format!("{}{}", LOCK_NAME_PREFIX, &hex[..16])
}

/// A non-blocking, cooperative lock primitive.
///
/// `Err` means the primitive itself is unavailable, not that the lock is held.
pub trait AdvisoryLock: Send + Sync {
    fn try_lock(&self, name: &str) -> Result<bool>;
    fn unlock(&self, name: &str) -> Result<bool>;
}

/// `flock(2)` locks on files in a directory.
///
/// The lock lives as long as the open file, so a killed process releases it
/// automatically.
pub struct FileAdvisoryLocks {
    dir: PathBuf,
    held: Mutex<HashMap<String, File>>,
}

impl FileAdvisoryLocks {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            held: Mutex::new(HashMap::new()),
        }
    }

    fn open_lock_file(&self, name: &str) -> Result<File> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create lock directory {:?}", self.dir))?;
        let path = self.dir.join(format!("{}.lock", name));
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {:?}", path))
    }
}

#[cfg(unix)]
fn flock(file: &File, operation: libc::c_int) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe { libc::flock(file.as_raw_fd(), operation | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

impl AdvisoryLock for FileAdvisoryLocks {
    #[cfg(unix)]
    fn try_lock(&self, name: &str) -> Result<bool> {
        let mut held = self.held.lock().unwrap();
        if held.contains_key(name) {
            return Ok(false);
        }
        let file = self.open_lock_file(name)?;
        let acquired = flock(&file, libc::LOCK_EX).context("flock failed")?;
        if acquired {
            held.insert(name.to_string(), file);
        }
        Ok(acquired)
    }

    #[cfg(not(unix))]
    fn try_lock(&self, _name: &str) -> Result<bool> {
        anyhow::bail!("File advisory locks are not supported on this platform")
    }

    #[cfg(unix)]
    fn unlock(&self, name: &str) -> Result<bool> {
        let file = self.held.lock().unwrap().remove(name);
        match file {
            Some(file) => {
                flock(&file, libc::LOCK_UN).context("flock unlock failed")?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    #[cfg(not(unix))]
    fn unlock(&self, _name: &str) -> Result<bool> {
        Ok(false)
    }
}

/// A fallback lock record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockInfo {
    pub name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Lock records in the `task_locks` table.
pub struct SqliteLockRecords {
    db: EngineDb,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl SqliteLockRecords {
    pub fn new(db: EngineDb, ttl: Duration) -> Self {
        Self::with_clock(db, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(db: EngineDb, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { db, ttl, clock }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn insert(&self, name: &str, holder: &str) -> Result<bool> {
        let inserted = self.db.conn().execute(
            "INSERT OR IGNORE INTO task_locks (name, holder, acquired_at, ttl_secs)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                name,
                holder,
                self.clock.now().timestamp_millis(),
                self.ttl.as_secs() as i64
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Creates the record if absent. An existing record past its TTL is
    /// considered abandoned: it is deleted and creation is retried once.
    pub fn try_acquire(&self, name: &str, holder: &str) -> Result<bool> {
        if self.insert(name, holder)? {
            return Ok(true);
        }

        let Some(existing) = self.inspect(name)? else {
            // Released between the insert and the lookup.
            return self.insert(name, holder);
        };
        if !existing.is_expired_at(self.clock.now()) {
            return Ok(false);
        }

        warn!(
            "Taking over abandoned lock {} held by {} since {}",
            name, existing.holder, existing.acquired_at
        );
        self.db.conn().execute(
            "DELETE FROM task_locks WHERE name = ?1 AND holder = ?2 AND acquired_at = ?3",
            params![
                name,
                existing.holder,
                existing.acquired_at.timestamp_millis()
            ],
        )?;
        self.insert(name, holder)
    }

    /// Deletes the record if `holder` owns it.
    pub fn release(&self, name: &str, holder: &str) -> Result<bool> {
        let deleted = self.db.conn().execute(
            "DELETE FROM task_locks WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )?;
        Ok(deleted > 0)
    }

    pub fn inspect(&self, name: &str) -> Result<Option<LockInfo>> {
        let conn = self.db.conn();
        let row = conn
            .query_row(
                "SELECT holder, acquired_at, ttl_secs FROM task_locks WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(holder, acquired_at, ttl_secs)| LockInfo {
            name: name.to_string(),
            holder,
            acquired_at: from_millis(acquired_at),
            expires_at: from_millis(acquired_at.saturating_add(ttl_secs.saturating_mul(1000))),
        }))
    }

    pub fn list(&self) -> Result<Vec<LockInfo>> {
        let conn = self.db.conn();
        let mut stmt =
            conn.prepare("SELECT name, holder, acquired_at, ttl_secs FROM task_locks ORDER BY name")?;
        let locks = stmt
            .query_map([], |row| {
                let acquired_at: i64 = row.get(2)?;
                let ttl_secs: i64 = row.get(3)?;
                Ok(LockInfo {
                    name: row.get(0)?,
                    holder: row.get(1)?,
                    acquired_at: from_millis(acquired_at),
                    expires_at: from_millis(
                        acquired_at.saturating_add(ttl_secs.saturating_mul(1000)),
                    ),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(locks)
    }

    /// Deletes every record past its TTL.
    pub fn sweep_expired(&self) -> Result<usize> {
        let deleted = self.db.conn().execute(
            "DELETE FROM task_locks WHERE acquired_at + ttl_secs * 1000 <= ?1",
            params![self.clock.now().timestamp_millis()],
        )?;
        Ok(deleted)
    }
}

/// Grants at most one holder per task id at a time.
///
/// Cheap to clone; clones share the holder identity and the underlying locks.
#[derive(Clone)]
pub struct LockManager {
    primary: Option<Arc<dyn AdvisoryLock>>,
    fallback: Arc<SqliteLockRecords>,
    holder: String,
}

impl LockManager {
    pub fn new(primary: Option<Arc<dyn AdvisoryLock>>, fallback: Arc<SqliteLockRecords>) -> Self {
        Self {
            primary,
            fallback,
            holder: format!("{}:{}", std::process::id(), Uuid::new_v4().simple()),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn records(&self) -> &SqliteLockRecords {
        &self.fallback
    }

    /// Non-blocking. `false` means someone else holds the lock (or no lock
    /// could be taken at all).
    pub fn acquire(&self, task_id: &str) -> bool {
        let name = lock_name(task_id);

        if let Some(primary) = &self.primary {
            match primary.try_lock(&name) {
                Ok(acquired) => {
                    debug!("Advisory lock {} for {}: acquired={}", name, task_id, acquired);
                    return acquired;
                }
                Err(e) => {
                    warn!(
                        "Advisory lock unavailable for {} ({:#}), using lock records",
                        task_id, e
                    );
                }
            }
        }

        match self.fallback.try_acquire(&name, &self.holder) {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!("Failed to create lock record for {}: {:#}", task_id, e);
                false
            }
        }
    }

    /// Releases through both strategies; whichever was not used is a no-op.
    /// Returns whether anything was released.
    pub fn release(&self, task_id: &str) -> bool {
        let name = lock_name(task_id);
        let mut released = false;

        if let Some(primary) = &self.primary {
            match primary.unlock(&name) {
                Ok(r) => released |= r,
                Err(e) => warn!("Failed to release advisory lock for {}: {:#}", task_id, e),
            }
        }
        match self.fallback.release(&name, &self.holder) {
            Ok(r) => released |= r,
            Err(e) => warn!("Failed to delete lock record for {}: {:#}", task_id, e),
        }

        if !released {
            info!("Release of {} found no lock held by {}", task_id, self.holder);
        }
        released
    }

    /// Acquires and returns a guard that releases on drop.
    pub fn guard(&self, task_id: &str) -> Option<LockGuard> {
        if self.acquire(task_id) {
            Some(LockGuard {
                manager: self.clone(),
                task_id: task_id.to_string(),
            })
        } else {
            None
        }
    }

    pub fn inspect(&self, task_id: &str) -> Result<Option<LockInfo>> {
        self.fallback.inspect(&lock_name(task_id))
    }

    pub fn sweep_expired(&self) -> Result<usize> {
        self.fallback.sweep_expired()
    }
}

/// Releases its lock when dropped, including during unwinding.
pub struct LockGuard {
    manager: LockManager,
    task_id: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.manager.release(&self.task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::clock::ManualClock;
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct UnavailableLock;

    impl AdvisoryLock for UnavailableLock {
        fn try_lock(&self, _name: &str) -> Result<bool> {
            anyhow::bail!("not available")
        }
        fn unlock(&self, _name: &str) -> Result<bool> {
            anyhow::bail!("not available")
        }
    }

    fn records(db: &EngineDb, clock: Arc<ManualClock>) -> Arc<SqliteLockRecords> {
        Arc::new(SqliteLockRecords::with_clock(
            db.clone(),
            DEFAULT_LOCK_TTL,
            clock,
        ))
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn test_lock_name_is_deterministic() {
        assert_eq!(lock_name("audit"), lock_name("audit"));
        assert_ne!(lock_name("audit"), lock_name("audit2"));
        assert!(lock_name("audit").starts_with(LOCK_NAME_PREFIX));
        assert_eq!(lock_name("audit").len(), LOCK_NAME_PREFIX.len() + 16);
        assert!(lock_name("audit")[LOCK_NAME_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_lock_excludes_second_holder() {
        let temp_dir = TempDir::new().unwrap();
        let db = EngineDb::open_in_memory().unwrap();
        let locks = Arc::new(FileAdvisoryLocks::new(temp_dir.path()));
        let first = LockManager::new(Some(locks.clone()), records(&db, clock()));
        // A second manager with its own file handles, as another process would have.
        let second = LockManager::new(
            Some(Arc::new(FileAdvisoryLocks::new(temp_dir.path()))),
            records(&db, clock()),
        );

        assert!(first.acquire("t"));
        assert!(!first.acquire("t"));
        assert!(!second.acquire("t"));
        assert!(second.acquire("other"));

        assert!(first.release("t"));
        assert!(second.acquire("t"));
        assert!(second.release("t"));
        assert!(!second.release("t"));
    }

    #[test]
    fn test_fallback_used_when_primary_unavailable() {
        let db = EngineDb::open_in_memory().unwrap();
        let manager = LockManager::new(Some(Arc::new(UnavailableLock)), records(&db, clock()));

        assert!(manager.acquire("t"));
        let info = manager.inspect("t").unwrap().unwrap();
        assert_eq!(info.holder, manager.holder());

        assert!(!manager.acquire("t"));
        assert!(manager.release("t"));
        assert!(manager.inspect("t").unwrap().is_none());
    }

    #[test]
    fn test_fallback_takes_over_abandoned_record() {
        let db = EngineDb::open_in_memory().unwrap();
        let clock = clock();
        let crashed = LockManager::new(None, records(&db, clock.clone()));
        let survivor = LockManager::new(None, records(&db, clock.clone()));

        assert!(crashed.acquire("t"));
        assert!(!survivor.acquire("t"));

        clock.advance(chrono::Duration::seconds(299));
        assert!(!survivor.acquire("t"));

        clock.advance(chrono::Duration::seconds(2));
        assert!(survivor.acquire("t"));
        assert_eq!(
            survivor.inspect("t").unwrap().unwrap().holder,
            survivor.holder()
        );

        // The crashed holder's late release must not remove the new record.
        assert!(!crashed.release("t"));
        assert!(survivor.inspect("t").unwrap().is_some());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let db = EngineDb::open_in_memory().unwrap();
        let manager = LockManager::new(None, records(&db, clock()));
        {
            let guard = manager.guard("t");
            assert!(guard.is_some());
            assert!(manager.guard("t").is_none());
        }
        assert!(manager.acquire("t"));
    }

    #[test]
    fn test_sweep_expired() {
        let db = EngineDb::open_in_memory().unwrap();
        let clock = clock();
        let manager = LockManager::new(None, records(&db, clock.clone()));
        assert!(manager.acquire("a"));
        clock.advance(chrono::Duration::seconds(200));
        assert!(manager.acquire("b"));
        clock.advance(chrono::Duration::seconds(200));

        assert_eq!(manager.sweep_expired().unwrap(), 1);
        let remaining = manager.records().list().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, lock_name("b"));
    }
}
