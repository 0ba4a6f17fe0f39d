//! Persistent storage for jobs and schedule definitions.
//!
//! Every state change is a single conditional UPDATE whose WHERE clause
//! encodes the source state, so two callers racing on the same job can never
//! both win. Callers learn whether they won from the returned `bool`. The
//! audit write for a change runs inside the same transaction through an
//! `AfterWrite` hook, so a change the audit log refused never commits.

use super::cadence::{Cadence, Schedule, ScheduleDefinition};
use super::models::{from_timestamp, to_timestamp, Job, JobFilter, JobStatus, Payload};
use super::retry_policy::FailureDecision;
use super::schema::JOBS_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::{open_versioned, open_versioned_in_memory};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Handle to jobs.db, shared by the job store and the lock manager.
#[derive(Clone)]
pub struct JobDb {
    conn: Arc<Mutex<Connection>>,
}

impl JobDb {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, JOBS_VERSIONED_SCHEMAS, "jobs")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = open_versioned_in_memory(JOBS_VERSIONED_SCHEMAS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("jobs database mutex poisoned"))?;
        f(&mut conn)
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        JobStatus::from_db_str(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown job status '{}'", s).into()))
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_db_str()))
    }
}

/// Hook run inside the write transaction once a change has applied, with the
/// row as it now reads. An error rolls the change back.
pub type AfterWrite<'a> = &'a dyn Fn(&Job) -> Result<()>;

/// Storage for job records and schedule definitions.
pub trait JobStore: Send + Sync {
    // === Jobs ===

    /// Insert a new job. The job must be Queued.
    fn insert(&self, job: &Job, after: AfterWrite<'_>) -> Result<()>;

    fn get(&self, id: &str) -> Result<Option<Job>>;

    /// List jobs matching the filter, newest first.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// The oldest due Queued job of each job type, oldest due time first.
    ///
    /// A backlog of one type yields a single candidate, so it never hides the
    /// due jobs of other types.
    fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;

    fn running_jobs(&self) -> Result<Vec<Job>>;

    // === State Transitions (atomic) ===
    //
    // Each returns false, and runs no hook, when the job is not in the source
    // state the transition requires.

    /// Queued → Running, only once the job is due.
    fn claim(
        &self,
        id: &str,
        run_token: &str,
        now: DateTime<Utc>,
        after: AfterWrite<'_>,
    ) -> Result<bool>;

    /// Running → Completed for the claim identified by `run_token`.
    fn complete(
        &self,
        id: &str,
        run_token: &str,
        now: DateTime<Utc>,
        after: AfterWrite<'_>,
    ) -> Result<bool>;

    /// Running → Queued (retry) or Running → Failed (exhausted) for the claim
    /// identified by `run_token`.
    fn record_failure(
        &self,
        id: &str,
        run_token: &str,
        decision: &FailureDecision,
        error: &str,
        now: DateTime<Utc>,
        after: AfterWrite<'_>,
    ) -> Result<bool>;

    /// Queued → Cancelled.
    fn cancel(&self, id: &str, now: DateTime<Utc>, after: AfterWrite<'_>) -> Result<bool>;

    /// Failed → Queued, due immediately. Keeps `attempt_count`.
    fn requeue_failed(&self, id: &str, after: AfterWrite<'_>) -> Result<bool>;

    // === Schedules ===

    /// Create or replace a schedule definition. An existing marker is kept.
    fn upsert_schedule(&self, definition: &ScheduleDefinition, now: DateTime<Utc>)
        -> Result<Schedule>;

    fn get_schedule(&self, name: &str) -> Result<Option<Schedule>>;

    fn list_schedules(&self) -> Result<Vec<Schedule>>;

    fn set_schedule_enabled(&self, name: &str, enabled: bool, now: DateTime<Utc>)
        -> Result<bool>;

    /// Advance the schedule's marker to `slot` and insert `job`, atomically.
    ///
    /// Returns false, and inserts nothing, when the marker is already at or past
    /// `slot`. When a job with the same dedupe key already exists the marker
    /// still advances but no second job is created and `after` is not run.
    fn enqueue_for_slot(
        &self,
        schedule_name: &str,
        slot: DateTime<Utc>,
        job: &Job,
        now: DateTime<Utc>,
        after: AfterWrite<'_>,
    ) -> Result<bool>;
}

pub struct SqliteJobStore {
    db: JobDb,
}

impl SqliteJobStore {
    pub fn new(db: JobDb) -> Self {
        Self { db }
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        Ok(Job {
            id: row.get("id")?,
            job_type: row.get("job_type")?,
            status: row.get("status")?,
            payload: Payload::from_bytes(row.get::<_, Vec<u8>>("payload")?),
            scheduled_at: row
                .get::<_, Option<i64>>("scheduled_at")?
                .map(from_timestamp),
            started_at: row.get::<_, Option<i64>>("started_at")?.map(from_timestamp),
            completed_at: row
                .get::<_, Option<i64>>("completed_at")?
                .map(from_timestamp),
            attempt_count: row.get("attempt_count")?,
            max_attempts: row.get("max_attempts")?,
            last_error: row.get("last_error")?,
            created_at: from_timestamp(row.get("created_at")?),
            created_by: row.get("created_by")?,
            dedupe_key: row.get("dedupe_key")?,
            run_token: row.get("run_token")?,
        })
    }

    fn row_to_schedule(row: &rusqlite::Row) -> rusqlite::Result<Schedule> {
        let cadence_json: String = row.get("cadence")?;
        let cadence: Cadence = serde_json::from_str(&cadence_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let enabled: i64 = row.get("enabled")?;
        Ok(Schedule {
            definition: ScheduleDefinition {
                name: row.get("name")?,
                job_type: row.get("job_type")?,
                cadence,
                payload: Payload::from_bytes(row.get::<_, Vec<u8>>("payload")?),
                enabled: enabled != 0,
            },
            last_slot: row.get::<_, Option<i64>>("last_slot")?.map(from_timestamp),
            created_at: from_timestamp(row.get("created_at")?),
            updated_at: from_timestamp(row.get("updated_at")?),
        })
    }

    fn insert_job(conn: &Connection, job: &Job) -> Result<usize> {
        let inserted = conn.execute(
            r#"INSERT INTO jobs (
                id, job_type, status, payload, scheduled_at, started_at, completed_at,
                attempt_count, max_attempts, last_error, created_at, created_by,
                dedupe_key, run_token
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(dedupe_key) DO NOTHING"#,
            params![
                job.id,
                job.job_type,
                job.status,
                job.payload.as_bytes(),
                job.scheduled_at.map(to_timestamp),
                job.started_at.map(to_timestamp),
                job.completed_at.map(to_timestamp),
                job.attempt_count,
                job.max_attempts,
                job.last_error,
                to_timestamp(job.created_at),
                job.created_by,
                job.dedupe_key,
                job.run_token,
            ],
        )?;
        Ok(inserted)
    }

    /// Apply one conditional UPDATE on job `id` and run `after` on the updated
    /// row, all in one transaction.
    fn transition(
        &self,
        id: &str,
        sql: &str,
        params: &[&dyn ToSql],
        after: AfterWrite<'_>,
    ) -> Result<bool> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            if tx.execute(sql, params)? != 1 {
                return Ok(false);
            }
            let job = tx.query_row("SELECT * FROM jobs WHERE id = ?1", [id], Self::row_to_job)?;
            after(&job)?;
            tx.commit()?;
            Ok(true)
        })
    }
}

impl JobStore for SqliteJobStore {
    fn insert(&self, job: &Job, after: AfterWrite<'_>) -> Result<()> {
        if job.status != JobStatus::Queued {
            anyhow::bail!("New jobs must be QUEUED, got {}", job.status);
        }
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let inserted = Self::insert_job(&tx, job)
                .with_context(|| format!("Failed to insert job {}", job.id))?;
            if inserted == 0 {
                anyhow::bail!(
                    "A job with dedupe key {:?} already exists",
                    job.dedupe_key
                );
            }
            after(job)?;
            tx.commit()?;
            Ok(())
        })
    }

    fn get(&self, id: &str) -> Result<Option<Job>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT * FROM jobs WHERE id = ?1", [id], Self::row_to_job)
                .optional()?)
        })
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(job_type) = &filter.job_type {
            clauses.push("job_type = ?");
            params.push(Box::new(job_type.clone()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            params.push(Box::new(status));
        }
        if let Some(from) = filter.created_from {
            clauses.push("created_at >= ?");
            params.push(Box::new(to_timestamp(from)));
        }
        if let Some(until) = filter.created_until {
            clauses.push("created_at < ?");
            params.push(Box::new(to_timestamp(until)));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT * FROM jobs {} ORDER BY created_at DESC, id ASC LIMIT ? OFFSET ?",
            where_clause
        );
        params.push(Box::new(filter.limit as i64));
        params.push(Box::new(filter.offset as i64));

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
            let jobs = stmt
                .query_map(param_refs.as_slice(), Self::row_to_job)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(jobs)
        })
    }

    fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"SELECT * FROM (
                       SELECT *, ROW_NUMBER() OVER (
                           PARTITION BY job_type
                           ORDER BY COALESCE(scheduled_at, created_at) ASC, created_at ASC
                       ) AS type_rank
                       FROM jobs
                       WHERE status = 'QUEUED'
                         AND (scheduled_at IS NULL OR scheduled_at <= ?1)
                   )
                   WHERE type_rank = 1
                   ORDER BY COALESCE(scheduled_at, created_at) ASC, created_at ASC
                   LIMIT ?2"#,
            )?;
            let jobs = stmt
                .query_map(params![to_timestamp(now), limit as i64], Self::row_to_job)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(jobs)
        })
    }

    fn running_jobs(&self) -> Result<Vec<Job>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM jobs WHERE status = 'RUNNING' ORDER BY started_at ASC",
            )?;
            let jobs = stmt
                .query_map([], Self::row_to_job)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(jobs)
        })
    }

    fn claim(
        &self,
        id: &str,
        run_token: &str,
        now: DateTime<Utc>,
        after: AfterWrite<'_>,
    ) -> Result<bool> {
        self.transition(
            id,
            r#"UPDATE jobs
               SET status = 'RUNNING', started_at = ?1, run_token = ?2
               WHERE id = ?3 AND status = 'QUEUED'
                 AND (scheduled_at IS NULL OR scheduled_at <= ?1)"#,
            params![to_timestamp(now), run_token, id],
            after,
        )
    }

    fn complete(
        &self,
        id: &str,
        run_token: &str,
        now: DateTime<Utc>,
        after: AfterWrite<'_>,
    ) -> Result<bool> {
        self.transition(
            id,
            r#"UPDATE jobs
               SET status = 'COMPLETED', completed_at = ?1, run_token = NULL
               WHERE id = ?2 AND status = 'RUNNING' AND run_token = ?3"#,
            params![to_timestamp(now), id, run_token],
            after,
        )
    }

    fn record_failure(
        &self,
        id: &str,
        run_token: &str,
        decision: &FailureDecision,
        error: &str,
        now: DateTime<Utc>,
        after: AfterWrite<'_>,
    ) -> Result<bool> {
        match decision {
            FailureDecision::Retry {
                attempt_count,
                retry_at,
            } => self.transition(
                id,
                r#"UPDATE jobs
                   SET status = 'QUEUED', attempt_count = ?1, scheduled_at = ?2,
                       last_error = ?3, run_token = NULL
                   WHERE id = ?4 AND status = 'RUNNING' AND run_token = ?5"#,
                params![attempt_count, to_timestamp(*retry_at), error, id, run_token],
                after,
            ),
            FailureDecision::Exhausted { attempt_count } => self.transition(
                id,
                r#"UPDATE jobs
                   SET status = 'FAILED', attempt_count = ?1, completed_at = ?2,
                       last_error = ?3, run_token = NULL
                   WHERE id = ?4 AND status = 'RUNNING' AND run_token = ?5"#,
                params![attempt_count, to_timestamp(now), error, id, run_token],
                after,
            ),
        }
    }

    fn cancel(&self, id: &str, now: DateTime<Utc>, after: AfterWrite<'_>) -> Result<bool> {
        self.transition(
            id,
            r#"UPDATE jobs SET status = 'CANCELLED', completed_at = ?1
               WHERE id = ?2 AND status = 'QUEUED'"#,
            params![to_timestamp(now), id],
            after,
        )
    }

    fn requeue_failed(&self, id: &str, after: AfterWrite<'_>) -> Result<bool> {
        self.transition(
            id,
            r#"UPDATE jobs
               SET status = 'QUEUED', scheduled_at = NULL, completed_at = NULL
               WHERE id = ?1 AND status = 'FAILED'"#,
            params![id],
            after,
        )
    }

    fn upsert_schedule(
        &self,
        definition: &ScheduleDefinition,
        now: DateTime<Utc>,
    ) -> Result<Schedule> {
        let cadence = serde_json::to_string(&definition.cadence)?;
        self.db.with_conn(|conn| {
            conn.execute(
                r#"INSERT INTO job_schedules
                       (name, job_type, cadence, payload, enabled, last_slot, created_at, updated_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?6)
                   ON CONFLICT(name) DO UPDATE SET
                       job_type = excluded.job_type,
                       cadence = excluded.cadence,
                       payload = excluded.payload,
                       enabled = excluded.enabled,
                       updated_at = excluded.updated_at"#,
                params![
                    definition.name,
                    definition.job_type,
                    cadence,
                    definition.payload.as_bytes(),
                    definition.enabled as i64,
                    to_timestamp(now),
                ],
            )
            .with_context(|| format!("Failed to save schedule {}", definition.name))?;

            conn.query_row(
                "SELECT * FROM job_schedules WHERE name = ?1",
                [&definition.name],
                Self::row_to_schedule,
            )
            .context("Schedule vanished right after upsert")
        })
    }

    fn get_schedule(&self, name: &str) -> Result<Option<Schedule>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM job_schedules WHERE name = ?1",
                    [name],
                    Self::row_to_schedule,
                )
                .optional()?)
        })
    }

    fn list_schedules(&self) -> Result<Vec<Schedule>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM job_schedules ORDER BY name ASC")?;
            let schedules = stmt
                .query_map([], Self::row_to_schedule)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(schedules)
        })
    }

    fn set_schedule_enabled(&self, name: &str, enabled: bool, now: DateTime<Utc>) -> Result<bool> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE job_schedules SET enabled = ?1, updated_at = ?2 WHERE name = ?3",
                params![enabled as i64, to_timestamp(now), name],
            )?;
            Ok(changed == 1)
        })
    }

    fn enqueue_for_slot(
        &self,
        schedule_name: &str,
        slot: DateTime<Utc>,
        job: &Job,
        now: DateTime<Utc>,
        after: AfterWrite<'_>,
    ) -> Result<bool> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let advanced = tx.execute(
                r#"UPDATE job_schedules SET last_slot = ?1, updated_at = ?2
                   WHERE name = ?3 AND (last_slot IS NULL OR last_slot < ?1)"#,
                params![to_timestamp(slot), to_timestamp(now), schedule_name],
            )?;
            if advanced == 0 {
                return Ok(false);
            }
            let inserted = Self::insert_job(&tx, job)? == 1;
            if inserted {
                after(job)?;
            }
            tx.commit()?;
            Ok(inserted)
        })
    }
}
