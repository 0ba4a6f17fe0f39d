//! Common test infrastructure
//!
//! Builds an engine over in-memory SQLite with a manual clock, a session gate
//! that records notifications and an audit sink that can be told to refuse
//! writes.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use jobkeeper::background_jobs::{
    Actor, ActorRole, AuditEvent, AuditSink, Clock, EngineSettings, HandlerError, HandlerOptions, Job,
    JobContext, JobDb, JobEngine, JobHandler, JobStatus, ManualClock, Payload, RetryPolicy,
    SessionGate, SqliteAuditLog, SqliteJobStore, SqliteLockManager,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

pub const LEASE_TTL_SECS: i64 = 300;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn admin() -> Actor {
    Actor::user("alice", ActorRole::Admin)
}

pub fn operator() -> Actor {
    Actor::user("olga", ActorRole::Operator)
}

pub fn viewer() -> Actor {
    Actor::user("victor", ActorRole::Viewer)
}

/// Audit sink over SQLite that refuses every write while `refusing` is set.
pub struct SwitchableAuditLog {
    inner: SqliteAuditLog,
    refusing: AtomicBool,
}

impl SwitchableAuditLog {
    pub fn new() -> Self {
        Self {
            inner: SqliteAuditLog::in_memory().unwrap(),
            refusing: AtomicBool::new(false),
        }
    }

    pub fn refuse_writes(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    pub fn events_for_job(&self, job_id: &str) -> Vec<AuditEvent> {
        self.inner.events_for_job(job_id).unwrap()
    }

    /// `(from, to)` pairs for a job, oldest first.
    pub fn transitions(&self, job_id: &str) -> Vec<(Option<JobStatus>, JobStatus)> {
        self.events_for_job(job_id)
            .into_iter()
            .map(|e| (e.from, e.to))
            .collect()
    }
}

impl AuditSink for SwitchableAuditLog {
    fn record_event(&self, event: &AuditEvent) -> Result<()> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(anyhow!("audit sink unavailable"));
        }
        self.inner.record_event(event)
    }
}

/// Records freeze/resume notifications as `"freeze:<job_type>"` and
/// `"resume:<job_type>"`.
#[derive(Default)]
pub struct RecordingSessionGate {
    events: Mutex<Vec<String>>,
}

impl RecordingSessionGate {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl SessionGate for RecordingSessionGate {
    fn freeze_writes(&self, job_type: &str, _job_id: &str) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("freeze:{}", job_type));
        Ok(())
    }

    fn resume_writes(&self, job_type: &str, _job_id: &str) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("resume:{}", job_type));
        Ok(())
    }
}

/// A gate handlers block on until the test opens it.
#[derive(Default)]
pub struct Latch {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }
}

/// Handler counting its runs. Fails while `fail` is set.
pub struct CountingHandler {
    pub runs: AtomicUsize,
    pub fail: AtomicBool,
    latch: Option<Arc<Latch>>,
}

impl CountingHandler {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            runs: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            latch: None,
        })
    }

    pub fn failing() -> Arc<Self> {
        let handler = Self::succeeding();
        handler.fail.store(true, Ordering::SeqCst);
        handler
    }

    /// Blocks every run until `latch` opens.
    pub fn blocking(latch: Arc<Latch>) -> Arc<Self> {
        Arc::new(Self {
            runs: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            latch: Some(latch),
        })
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl JobHandler for CountingHandler {
    fn execute(&self, _ctx: &JobContext, _payload: &Payload) -> Result<(), HandlerError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(latch) = &self.latch {
            latch.wait();
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(HandlerError::failed("upstream unavailable"));
        }
        Ok(())
    }
}

pub struct TestEngine {
    pub engine: JobEngine,
    pub clock: ManualClock,
    pub store: Arc<SqliteJobStore>,
    pub locks: Arc<SqliteLockManager>,
    pub audit: Arc<SwitchableAuditLog>,
    pub sessions: Arc<RecordingSessionGate>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_settings(EngineSettings::default())
    }

    pub fn with_max_workers(max_workers: usize) -> Self {
        Self::with_settings(EngineSettings {
            max_workers,
            ..Default::default()
        })
    }

    fn with_settings(base: EngineSettings) -> Self {
        let db = JobDb::in_memory().unwrap();
        let store = Arc::new(SqliteJobStore::new(db.clone()));
        let locks = Arc::new(SqliteLockManager::new(db));
        let audit = Arc::new(SwitchableAuditLog::new());
        let sessions = Arc::new(RecordingSessionGate::default());
        let clock = ManualClock::new(t0());

        let settings = EngineSettings {
            node_id: "test-node".to_string(),
            lease_ttl: Duration::seconds(LEASE_TTL_SECS),
            retry: RetryPolicy::default(),
            ..base
        };
        let engine = JobEngine::builder(store.clone(), locks.clone(), audit.clone())
            .settings(settings)
            .clock(Arc::new(clock.clone()))
            .session_gate(sessions.clone())
            .build();

        Self {
            engine,
            clock,
            store,
            locks,
            audit,
            sessions,
        }
    }

    pub fn register(&self, job_type: &str, handler: Arc<CountingHandler>) {
        self.register_with(job_type, handler, HandlerOptions::default());
    }

    pub fn register_with(
        &self,
        job_type: &str,
        handler: Arc<CountingHandler>,
        options: HandlerOptions,
    ) {
        self.engine.register(job_type, handler, options).unwrap();
    }

    pub fn submit(&self, job_type: &str) -> String {
        self.engine
            .submit(job_type, Payload::empty(), None, &operator())
            .unwrap()
    }

    pub fn job(&self, job_id: &str) -> Job {
        self.engine.admin().get(&admin(), job_id).unwrap()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Poll once and wait for everything it started.
    pub async fn poll_and_settle(&self) -> usize {
        let report = self.engine.poll().await.unwrap();
        self.engine.wait_idle().await;
        report.jobs_started
    }
}

/// Store hook for writes made behind the engine's back.
pub fn unaudited(_: &Job) -> Result<()> {
    Ok(())
}
