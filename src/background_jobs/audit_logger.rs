//! Audit trail for job state transitions.
//!
//! The engine only ever appends. Reads exist on the SQLite sink for the CLI
//! and for tests.

use super::error::EngineError;
use super::models::{from_timestamp, to_timestamp, Job, JobStatus};
use super::schema::JOB_AUDIT_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::{open_versioned, open_versioned_in_memory};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One recorded transition. `from` is `None` for job creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub job_id: String,
    pub from: Option<JobStatus>,
    pub to: JobStatus,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Append-only event log collaborator.
pub trait AuditSink: Send + Sync {
    fn record_event(&self, event: &AuditEvent) -> Result<()>;
}

/// Audit sink backed by job_audit.db.
pub struct SqliteAuditLog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAuditLog {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, JOB_AUDIT_VERSIONED_SCHEMAS, "job audit")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = open_versioned_in_memory(JOB_AUDIT_VERSIONED_SCHEMAS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<AuditEvent> {
        Ok(AuditEvent {
            job_id: row.get("job_id")?,
            from: row.get("from_status")?,
            to: row.get("to_status")?,
            actor: row.get("actor")?,
            timestamp: from_timestamp(row.get("timestamp")?),
            reason: row.get("reason")?,
        })
    }

    fn query(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<AuditEvent>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("audit database mutex poisoned"))?;
        let mut stmt = conn.prepare(sql)?;
        let events = stmt
            .query_map(params, Self::row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// All events for a job, oldest first.
    pub fn events_for_job(&self, job_id: &str) -> Result<Vec<AuditEvent>> {
        self.query(
            "SELECT * FROM job_audit_log WHERE job_id = ?1 ORDER BY id ASC",
            &[&job_id],
        )
    }

    /// The latest `limit` events, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        self.query(
            "SELECT * FROM job_audit_log ORDER BY id DESC LIMIT ?1",
            &[&(limit as i64)],
        )
    }
}

impl AuditSink for SqliteAuditLog {
    fn record_event(&self, event: &AuditEvent) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("audit database mutex poisoned"))?;
        conn.execute(
            r#"INSERT INTO job_audit_log (job_id, from_status, to_status, actor, timestamp, reason)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                event.job_id,
                event.from,
                event.to,
                event.actor,
                to_timestamp(event.timestamp),
                event.reason,
            ],
        )?;
        Ok(())
    }
}

/// Builds audit events for the engine and turns sink failures into
/// `EngineError::Audit`.
#[derive(Clone)]
pub struct AuditEmitter {
    sink: Arc<dyn AuditSink>,
}

impl AuditEmitter {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Record a job entering Queued for the first time.
    pub fn job_created(&self, job: &Job, reason: Option<String>) -> Result<(), EngineError> {
        self.record(AuditEvent {
            job_id: job.id.clone(),
            from: None,
            to: JobStatus::Queued,
            actor: job.created_by.clone(),
            timestamp: job.created_at,
            reason,
        })
    }

    pub fn transition(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
        actor: &str,
        timestamp: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        self.record(AuditEvent {
            job_id: job_id.to_string(),
            from: Some(from),
            to,
            actor: actor.to_string(),
            timestamp,
            reason,
        })
    }

    /// `job_created` as a store hook.
    pub fn on_created(&self, reason: Option<String>) -> impl Fn(&Job) -> Result<()> + '_ {
        move |job| {
            self.job_created(job, reason.clone())
                .map_err(anyhow::Error::from)
        }
    }

    /// `transition` as a store hook, for the job the store just updated.
    pub fn on_transition<'a>(
        &'a self,
        from: JobStatus,
        to: JobStatus,
        actor: &'a str,
        timestamp: DateTime<Utc>,
        reason: Option<String>,
    ) -> impl Fn(&Job) -> Result<()> + 'a {
        move |job| {
            self.transition(&job.id, from, to, actor, timestamp, reason.clone())
                .map_err(anyhow::Error::from)
        }
    }

    fn record(&self, event: AuditEvent) -> Result<(), EngineError> {
        debug!(
            "Audit: job {} {:?} -> {} by {}",
            event.job_id, event.from, event.to, event.actor
        );
        self.sink.record_event(&event).map_err(EngineError::Audit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::models::{Actor, Payload};
    use chrono::TimeZone;

    struct RefusingSink;

    impl AuditSink for RefusingSink {
        fn record_event(&self, _event: &AuditEvent) -> Result<()> {
            Err(anyhow!("event log unavailable"))
        }
    }

    #[test]
    fn test_sqlite_audit_log_appends_and_reads() {
        let log = SqliteAuditLog::in_memory().unwrap();
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        log.record_event(&AuditEvent {
            job_id: "job-1".to_string(),
            from: None,
            to: JobStatus::Queued,
            actor: "system:scheduler".to_string(),
            timestamp: t,
            reason: None,
        })
        .unwrap();
        log.record_event(&AuditEvent {
            job_id: "job-1".to_string(),
            from: Some(JobStatus::Queued),
            to: JobStatus::Cancelled,
            actor: "alice".to_string(),
            timestamp: t,
            reason: Some("no longer needed".to_string()),
        })
        .unwrap();
        log.record_event(&AuditEvent {
            job_id: "job-2".to_string(),
            from: None,
            to: JobStatus::Queued,
            actor: "bob".to_string(),
            timestamp: t,
            reason: None,
        })
        .unwrap();

        let events = log.events_for_job("job-1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].from, None);
        assert_eq!(events[1].from, Some(JobStatus::Queued));
        assert_eq!(events[1].to, JobStatus::Cancelled);
        assert_eq!(events[1].reason.as_deref(), Some("no longer needed"));

        let recent = log.recent(1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].job_id, "job-2");
    }

    #[test]
    fn test_emitter_maps_sink_failure_to_audit_error() {
        let emitter = AuditEmitter::new(Arc::new(RefusingSink));
        let job = Job::new_queued(
            "cleanup",
            Payload::empty(),
            None,
            5,
            &Actor::system("test"),
            Utc::now(),
        );

        let err = emitter.job_created(&job, None).unwrap_err();
        assert!(matches!(err, EngineError::Audit(_)));
        assert!(err.to_string().contains("event log unavailable"));
    }

    #[test]
    fn test_emitter_uses_job_creator_as_actor() {
        let log = Arc::new(SqliteAuditLog::in_memory().unwrap());
        let emitter = AuditEmitter::new(log.clone());
        let job = Job::new_queued(
            "cleanup",
            Payload::empty(),
            None,
            5,
            &Actor::user("alice", crate::background_jobs::models::ActorRole::Operator),
            Utc::now(),
        );
        emitter.job_created(&job, None).unwrap();

        let events = log.events_for_job(&job.id).unwrap();
        assert_eq!(events[0].actor, "alice");
        assert_eq!(events[0].to, JobStatus::Queued);
    }
}
