//! Lease-based mutual exclusion keyed by concurrency key.
//!
//! Locks live in the `job_locks` table of jobs.db so they survive restarts.
//! A lock whose `expires_at` is at or before "now" counts as absent: the next
//! acquisition replaces it, and the dispatcher treats the job that held it as
//! orphaned.

use super::job_store::JobDb;
use super::models::{from_timestamp, to_timestamp};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};

/// Lock key used by globally exclusive job types.
pub const GLOBAL_LOCK_KEY: &str = "__global__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub key: String,
    pub holder: String,
    pub job_id: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_global(&self) -> bool {
        self.key == GLOBAL_LOCK_KEY
    }
}

/// Atomic lease operations. Nothing above this trait may infer exclusivity any
/// other way.
pub trait LockManager: Send + Sync {
    /// Take `key` for `holder` until `now + ttl`.
    ///
    /// Succeeds only if no unexpired lock exists for `key`. Returns false on
    /// contention.
    fn acquire(
        &self,
        key: &str,
        holder: &str,
        job_id: Option<&str>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Remove `holder`'s lock on `key`. Releasing a lock that is gone, or that
    /// somebody else now holds, is a no-op returning false.
    fn release(&self, key: &str, holder: &str) -> Result<bool>;

    /// Push the expiry of a live lease held by `holder` to `now + ttl`.
    fn renew(&self, key: &str, holder: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool>;

    fn get(&self, key: &str) -> Result<Option<LockRecord>>;

    /// The lease held by `holder`, expired or not.
    fn held_by(&self, holder: &str) -> Result<Option<LockRecord>>;

    /// All leases that expired at or before `now`.
    fn expired(&self, now: DateTime<Utc>) -> Result<Vec<LockRecord>>;

    /// Delete an expired lease, provided it was not re-acquired or renewed in
    /// the meantime.
    fn reclaim(&self, lock: &LockRecord, now: DateTime<Utc>) -> Result<bool>;
}

pub struct SqliteLockManager {
    db: JobDb,
}

impl SqliteLockManager {
    pub fn new(db: JobDb) -> Self {
        Self { db }
    }

    fn row_to_lock(row: &rusqlite::Row) -> rusqlite::Result<LockRecord> {
        Ok(LockRecord {
            key: row.get("lock_key")?,
            holder: row.get("holder")?,
            job_id: row.get("job_id")?,
            acquired_at: from_timestamp(row.get("acquired_at")?),
            expires_at: from_timestamp(row.get("expires_at")?),
        })
    }
}

impl LockManager for SqliteLockManager {
    fn acquire(
        &self,
        key: &str,
        holder: &str,
        job_id: Option<&str>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now_ts = to_timestamp(now);
        let expires_ts = to_timestamp(now + ttl);
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                r#"INSERT INTO job_locks (lock_key, holder, job_id, acquired_at, expires_at)
                   VALUES (?1, ?2, ?3, ?4, ?5)
                   ON CONFLICT(lock_key) DO UPDATE SET
                       holder = excluded.holder,
                       job_id = excluded.job_id,
                       acquired_at = excluded.acquired_at,
                       expires_at = excluded.expires_at
                   WHERE job_locks.expires_at <= ?4"#,
                params![key, holder, job_id, now_ts, expires_ts],
            )?;
            Ok(changed == 1)
        })
    }

    fn release(&self, key: &str, holder: &str) -> Result<bool> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM job_locks WHERE lock_key = ?1 AND holder = ?2",
                params![key, holder],
            )?;
            Ok(changed == 1)
        })
    }

    fn renew(&self, key: &str, holder: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                r#"UPDATE job_locks SET expires_at = ?1
                   WHERE lock_key = ?2 AND holder = ?3 AND expires_at > ?4"#,
                params![to_timestamp(now + ttl), key, holder, to_timestamp(now)],
            )?;
            Ok(changed == 1)
        })
    }

    fn get(&self, key: &str) -> Result<Option<LockRecord>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM job_locks WHERE lock_key = ?1",
                    [key],
                    Self::row_to_lock,
                )
                .optional()?)
        })
    }

    fn held_by(&self, holder: &str) -> Result<Option<LockRecord>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM job_locks WHERE holder = ?1 LIMIT 1",
                    [holder],
                    Self::row_to_lock,
                )
                .optional()?)
        })
    }

    fn expired(&self, now: DateTime<Utc>) -> Result<Vec<LockRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM job_locks WHERE expires_at <= ?1 ORDER BY expires_at ASC",
            )?;
            let locks = stmt
                .query_map([to_timestamp(now)], Self::row_to_lock)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(locks)
        })
    }

    fn reclaim(&self, lock: &LockRecord, now: DateTime<Utc>) -> Result<bool> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                r#"DELETE FROM job_locks
                   WHERE lock_key = ?1 AND holder = ?2 AND expires_at <= ?3"#,
                params![lock.key, lock.holder, to_timestamp(now)],
            )?;
            Ok(changed == 1)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn manager() -> SqliteLockManager {
        SqliteLockManager::new(JobDb::in_memory().unwrap())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    const TTL: i64 = 300;

    #[test]
    fn test_acquire_is_exclusive_until_expiry() {
        let locks = manager();
        let ttl = Duration::seconds(TTL);

        assert!(locks.acquire("cleanup", "a", Some("job-1"), ttl, t0()).unwrap());
        assert!(!locks.acquire("cleanup", "b", Some("job-2"), ttl, t0()).unwrap());
        assert!(!locks
            .acquire("cleanup", "b", None, ttl, t0() + Duration::seconds(TTL - 1))
            .unwrap());

        // Other keys are independent.
        assert!(locks.acquire("other", "b", None, ttl, t0()).unwrap());

        // Expired lease counts as absent.
        let later = t0() + Duration::seconds(TTL);
        assert!(locks.acquire("cleanup", "b", Some("job-2"), ttl, later).unwrap());
        let record = locks.get("cleanup").unwrap().unwrap();
        assert_eq!(record.holder, "b");
        assert_eq!(record.job_id.as_deref(), Some("job-2"));
        assert_eq!(record.acquired_at, later);
    }

    #[test]
    fn test_release_is_idempotent_and_holder_scoped() {
        let locks = manager();
        let ttl = Duration::seconds(TTL);
        locks.acquire("cleanup", "a", None, ttl, t0()).unwrap();

        assert!(!locks.release("cleanup", "intruder").unwrap());
        assert!(locks.get("cleanup").unwrap().is_some());

        assert!(locks.release("cleanup", "a").unwrap());
        assert!(!locks.release("cleanup", "a").unwrap());
        assert!(locks.get("cleanup").unwrap().is_none());
    }

    #[test]
    fn test_renew_extends_live_lease_only() {
        let locks = manager();
        let ttl = Duration::seconds(TTL);
        locks.acquire("cleanup", "a", None, ttl, t0()).unwrap();

        let mid = t0() + Duration::seconds(100);
        assert!(locks.renew("cleanup", "a", ttl, mid).unwrap());
        assert_eq!(
            locks.get("cleanup").unwrap().unwrap().expires_at,
            mid + ttl
        );
        assert!(!locks.renew("cleanup", "b", ttl, mid).unwrap());

        let after = mid + ttl;
        assert!(!locks.renew("cleanup", "a", ttl, after).unwrap());
    }

    #[test]
    fn test_expired_and_reclaim() {
        let locks = manager();
        let ttl = Duration::seconds(TTL);
        locks.acquire("cleanup", "a", Some("job-1"), ttl, t0()).unwrap();
        locks
            .acquire(GLOBAL_LOCK_KEY, "g", Some("job-2"), Duration::seconds(10_000), t0())
            .unwrap();

        let later = t0() + Duration::seconds(TTL + 1);
        let expired = locks.expired(later).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, "cleanup");
        assert!(expired[0].is_expired(later));
        assert!(!expired[0].is_global());

        assert!(locks.reclaim(&expired[0], later).unwrap());
        assert!(!locks.reclaim(&expired[0], later).unwrap());
        assert!(locks.get("cleanup").unwrap().is_none());
        assert!(locks.held_by("g").unwrap().unwrap().is_global());
    }

    #[test]
    fn test_reclaim_skips_reacquired_lock() {
        let locks = manager();
        let ttl = Duration::seconds(TTL);
        locks.acquire("cleanup", "a", None, ttl, t0()).unwrap();

        let later = t0() + Duration::seconds(TTL + 1);
        let stale = locks.expired(later).unwrap().remove(0);
        assert!(locks.acquire("cleanup", "b", None, ttl, later).unwrap());

        assert!(!locks.reclaim(&stale, later).unwrap());
        assert_eq!(locks.get("cleanup").unwrap().unwrap().holder, "b");
    }
}
