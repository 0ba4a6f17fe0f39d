//! The job engine: wiring of store, locks, scheduler, dispatcher and admin
//! surface, plus the poll loop that drives them.

use super::access::{AccessControl, JobPermission, RoleAccessControl};
use super::admin::AdminControl;
use super::audit_logger::{AuditEmitter, AuditSink, SqliteAuditLog};
use super::cadence::{Schedule, ScheduleDefinition};
use super::clock::{Clock, SystemClock};
use super::dispatcher::Dispatcher;
use super::error::EngineError;
use super::job_store::{JobDb, JobStore, SqliteJobStore};
use super::lock_manager::{LockManager, SqliteLockManager};
use super::models::{Actor, Job, JobId, JobStatus, Payload};
use super::registry::{HandlerOptions, HandlerRegistry, JobHandler, RegisteredHandler};
use super::retry_policy::{FailureCause, RetryPolicy};
use super::scheduler::Scheduler;
use super::session::{LoggingSessionGate, SessionGate};
use crate::metrics;
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const JOBS_DB_FILE: &str = "jobs.db";
pub const AUDIT_DB_FILE: &str = "job_audit.db";

/// Tunables of a running engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Prefix of every run token issued by this process.
    pub node_id: String,
    pub poll_interval: Duration,
    /// Upper bound on handlers running at once.
    pub max_workers: usize,
    /// Lease length. Running handlers renew it every third of this.
    pub lease_ttl: chrono::Duration,
    pub retry: RetryPolicy,
    /// Job types considered per poll, one due job each.
    pub poll_batch: usize,
    /// How long shutdown waits for in-flight handlers.
    pub shutdown_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", std::process::id()),
            poll_interval: Duration::from_secs(5),
            max_workers: 4,
            lease_ttl: chrono::Duration::seconds(300),
            retry: RetryPolicy::default(),
            poll_batch: 100,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// State shared by the scheduler, the dispatcher and the admin surface.
pub(crate) struct EngineCore {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) locks: Arc<dyn LockManager>,
    pub(crate) registry: HandlerRegistry,
    pub(crate) audit: AuditEmitter,
    pub(crate) access: Arc<dyn AccessControl>,
    pub(crate) session: Arc<dyn SessionGate>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: EngineSettings,
}

impl EngineCore {
    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Fresh claim token. Doubles as the lock holder for the claim.
    pub(crate) fn new_run_token(&self) -> String {
        format!("{}:{}", self.settings.node_id, uuid::Uuid::new_v4())
    }

    pub(crate) fn authorize(
        &self,
        actor: &Actor,
        permission: JobPermission,
    ) -> Result<(), EngineError> {
        if self.access.is_allowed(actor, permission) {
            Ok(())
        } else {
            warn!("Denied {} to {}", permission.action(), actor);
            Err(EngineError::PermissionDenied {
                actor: actor.name.clone(),
                action: permission.action(),
            })
        }
    }

    /// Take the handler's lock key for `holder`. Globally exclusive keys freeze
    /// user sessions once held.
    pub(crate) fn acquire_lock(
        &self,
        handler: &RegisteredHandler,
        holder: &str,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let acquired = self.locks.acquire(
            &handler.lock_key,
            holder,
            Some(job_id),
            self.settings.lease_ttl,
            now,
        )?;
        if !acquired {
            metrics::record_lock_contention(&handler.lock_key);
            return Ok(false);
        }
        if handler.is_globally_exclusive() {
            if let Err(e) = self.session.freeze_writes(&handler.job_type, job_id) {
                warn!("Failed to freeze sessions for {}: {:#}", job_id, e);
            }
        }
        Ok(true)
    }

    /// Release `holder`'s lock. Never fails: a lock we cannot delete expires.
    pub(crate) fn release_lock(&self, handler: &RegisteredHandler, holder: &str, job_id: &str) {
        match self.locks.release(&handler.lock_key, holder) {
            Ok(true) => {
                if handler.is_globally_exclusive() {
                    self.resume_sessions(&handler.job_type, job_id);
                }
            }
            Ok(false) => debug!(
                "Lock {} for job {} was already gone on release",
                handler.lock_key, job_id
            ),
            Err(e) => error!(
                "Failed to release lock {} for job {}: {:#}",
                handler.lock_key, job_id, e
            ),
        }
    }

    pub(crate) fn resume_sessions(&self, job_type: &str, job_id: &str) {
        if let Err(e) = self.session.resume_writes(job_type, job_id) {
            warn!("Failed to resume sessions after {}: {:#}", job_id, e);
        }
    }

    /// Count a failed attempt against `job` (which must be the Running row of
    /// the claim `run_token`) and move it to Queued or Failed.
    ///
    /// Returns false if the claim was already settled elsewhere.
    pub(crate) fn record_failure(
        &self,
        job: &Job,
        run_token: &str,
        cause: FailureCause,
        error: &str,
    ) -> Result<bool, EngineError> {
        let now = self.now();
        let decision = self.settings.retry.decide(job, now);
        let to = if decision.is_exhausted() {
            JobStatus::Failed
        } else {
            JobStatus::Queued
        };
        let actor = Actor::system("dispatcher");
        let hook = self.audit.on_transition(
            JobStatus::Running,
            to,
            &actor.name,
            now,
            Some(format!("{}: {}", cause.as_str(), error)),
        );
        let applied = self
            .store
            .record_failure(&job.id, run_token, &decision, error, now, &hook)
            .map_err(EngineError::from_store)?;

        if applied {
            if decision.is_exhausted() {
                error!(
                    "Job {} ({}) failed permanently after {} attempts: {}",
                    job.id,
                    job.job_type,
                    decision.attempt_count(),
                    error
                );
            } else {
                warn!(
                    "Job {} ({}) attempt {} {}; retrying at {}",
                    job.id,
                    job.job_type,
                    decision.attempt_count(),
                    cause.as_str(),
                    now + self.settings.retry.retry_delay
                );
            }
        }
        Ok(applied)
    }
}

/// Builder for `JobEngine`.
pub struct JobEngineBuilder {
    store: Arc<dyn JobStore>,
    locks: Arc<dyn LockManager>,
    audit_sink: Arc<dyn AuditSink>,
    access: Arc<dyn AccessControl>,
    session: Arc<dyn SessionGate>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    shutdown: CancellationToken,
}

impl JobEngineBuilder {
    pub fn new(
        store: Arc<dyn JobStore>,
        locks: Arc<dyn LockManager>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            locks,
            audit_sink,
            access: Arc::new(RoleAccessControl),
            session: Arc::new(LoggingSessionGate),
            clock: Arc::new(SystemClock),
            settings: EngineSettings::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// SQLite store and lock manager over one jobs database.
    pub fn sqlite(db: JobDb, audit_sink: Arc<dyn AuditSink>) -> Self {
        Self::new(
            Arc::new(SqliteJobStore::new(db.clone())),
            Arc::new(SqliteLockManager::new(db)),
            audit_sink,
        )
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn access_control(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = access;
        self
    }

    pub fn session_gate(mut self, session: Arc<dyn SessionGate>) -> Self {
        self.session = session;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn build(self) -> JobEngine {
        let core = Arc::new(EngineCore {
            store: self.store,
            locks: self.locks,
            registry: HandlerRegistry::new(),
            audit: AuditEmitter::new(self.audit_sink),
            access: self.access,
            session: self.session,
            clock: self.clock,
            settings: self.settings,
        });
        JobEngine {
            scheduler: Scheduler::new(Arc::clone(&core)),
            dispatcher: Dispatcher::new(Arc::clone(&core), self.shutdown.clone()),
            admin: AdminControl::new(Arc::clone(&core)),
            shutdown: self.shutdown,
            core,
        }
    }
}

/// Counts from one pass of the poll loop.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub orphans_recovered: usize,
    pub jobs_enqueued: usize,
    pub jobs_started: usize,
}

/// Background job engine.
///
/// Must be used from within a tokio runtime: handlers run on its blocking pool.
pub struct JobEngine {
    core: Arc<EngineCore>,
    scheduler: Scheduler,
    dispatcher: Dispatcher,
    admin: AdminControl,
    shutdown: CancellationToken,
}

impl JobEngine {
    pub fn builder(
        store: Arc<dyn JobStore>,
        locks: Arc<dyn LockManager>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> JobEngineBuilder {
        JobEngineBuilder::new(store, locks, audit_sink)
    }

    /// Builder over `<db_dir>/jobs.db` and `<db_dir>/job_audit.db`.
    ///
    /// Also returns the audit log so callers can read it back.
    pub fn open_sqlite(db_dir: &Path) -> anyhow::Result<(JobEngineBuilder, Arc<SqliteAuditLog>)> {
        std::fs::create_dir_all(db_dir)
            .with_context(|| format!("Failed to create database directory {:?}", db_dir))?;
        let db = JobDb::open(db_dir.join(JOBS_DB_FILE))?;
        let audit = Arc::new(SqliteAuditLog::open(db_dir.join(AUDIT_DB_FILE))?);
        Ok((JobEngineBuilder::sqlite(db, audit.clone()), audit))
    }

    // === Registration & submission ===

    /// Register the handler for `job_type`. Done once per type at startup.
    pub fn register(
        &self,
        job_type: &str,
        handler: Arc<dyn JobHandler>,
        options: HandlerOptions,
    ) -> Result<(), EngineError> {
        self.core.registry.register(
            job_type,
            handler,
            options,
            self.core.settings.retry.default_max_attempts,
        )
    }

    pub fn registered_job_types(&self) -> Vec<String> {
        self.core.registry.job_types()
    }

    /// Queue a job. `scheduled_at = None` means as soon as possible.
    ///
    /// Fails with `Configuration` if no handler is registered for `job_type`;
    /// no record is created in that case.
    pub fn submit(
        &self,
        job_type: &str,
        payload: Payload,
        scheduled_at: Option<DateTime<Utc>>,
        created_by: &Actor,
    ) -> Result<JobId, EngineError> {
        let handler = self.core.registry.require(job_type)?;
        let now = self.core.now();
        let job = Job::new_queued(
            job_type,
            payload,
            scheduled_at,
            handler.max_attempts,
            created_by,
            now,
        );
        let hook = self.core.audit.on_created(None);
        self.core
            .store
            .insert(&job, &hook)
            .map_err(EngineError::from_store)?;
        info!(
            "Queued job {} ({}) for {} by {}",
            job.id,
            job_type,
            scheduled_at.map_or_else(|| "now".to_string(), |at| at.to_rfc3339()),
            created_by
        );
        Ok(job.id)
    }

    /// Start a job right away under its lock, or fail with `LockContention`.
    ///
    /// The lock is taken before any record exists, so a rejected submission
    /// leaves no trace and consumes no attempt anywhere.
    pub async fn run_now(
        &self,
        job_type: &str,
        payload: Payload,
        actor: &Actor,
    ) -> Result<JobId, EngineError> {
        self.core.authorize(actor, JobPermission::SubmitJobs)?;
        self.dispatcher.run_now(job_type, payload, actor).await
    }

    // === Schedules ===

    /// Create or update a schedule. The catch-up marker of an existing schedule
    /// is kept.
    pub fn upsert_schedule(&self, definition: ScheduleDefinition) -> Result<Schedule, EngineError> {
        definition
            .cadence
            .validate()
            .map_err(|e| EngineError::Configuration(format!("Schedule {}: {}", definition.name, e)))?;
        if definition.name.trim().is_empty() {
            return Err(EngineError::Configuration(
                "Schedule name must not be empty".to_string(),
            ));
        }
        self.core.registry.require(&definition.job_type)?;
        let schedule = self.core.store.upsert_schedule(&definition, self.core.now())?;
        info!(
            "Schedule {} -> {} ({}, {})",
            definition.name,
            definition.job_type,
            definition.cadence,
            if definition.enabled { "enabled" } else { "disabled" }
        );
        Ok(schedule)
    }

    // === Driving the engine ===

    /// Evaluate schedules once at the current time.
    pub fn tick(&self) -> Result<Vec<JobId>, EngineError> {
        self.scheduler.tick(self.core.now())
    }

    /// One pass of the loop: recover orphans, evaluate schedules, start due jobs.
    ///
    /// Recovery and scheduling failures are logged and do not hold back
    /// dispatch.
    pub async fn poll(&self) -> Result<PollReport, EngineError> {
        let now = self.core.now();
        let orphans_recovered = self.dispatcher.recover_orphans(now).unwrap_or_else(|e| {
            error!("Orphan recovery failed: {}", e);
            0
        });
        let jobs_enqueued = match self.scheduler.tick(now) {
            Ok(enqueued) => enqueued.len(),
            Err(e) => {
                error!("Schedule evaluation failed: {}", e);
                0
            }
        };
        let jobs_started = self.dispatcher.dispatch_due(now)?;
        Ok(PollReport {
            orphans_recovered,
            jobs_enqueued,
            jobs_started,
        })
    }

    /// Wait until no handler started by this engine is running.
    pub async fn wait_idle(&self) {
        self.dispatcher.wait_idle().await;
    }

    pub fn admin(&self) -> &AdminControl {
        &self.admin
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Poll until the shutdown token fires, then wait for in-flight handlers.
    pub async fn run(&self) {
        info!(
            "Starting job engine on {} with {} registered job types",
            self.core.settings.node_id,
            self.core.registry.job_types().len()
        );

        loop {
            match self.poll().await {
                Ok(report) if report != PollReport::default() => debug!("Poll: {:?}", report),
                Ok(_) => {}
                Err(e) => error!("Job engine poll failed: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.core.settings.poll_interval) => {}
                _ = self.shutdown.cancelled() => {
                    info!("Job engine received shutdown signal");
                    break;
                }
            }
        }

        self.dispatcher
            .shutdown(self.core.settings.shutdown_timeout)
            .await;
        info!("Job engine shutdown complete");
    }
}
