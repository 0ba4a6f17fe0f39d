//! Background job execution and scheduling.
//!
//! Jobs are persisted records driven through Queued → Running → Completed /
//! Failed / Cancelled. Schedules enqueue jobs for their latest passed slot,
//! the dispatcher runs due jobs under leased locks, and every transition is
//! written to the audit log in the same transaction that applies it.

pub mod access;
mod admin;
pub mod audit_logger;
pub mod cadence;
pub mod clock;
mod context;
mod dispatcher;
mod engine;
mod error;
pub mod job_store;
pub mod jobs;
pub mod lock_manager;
mod models;
mod registry;
pub mod retry_policy;
mod scheduler;
mod schema;
pub mod session;

pub use access::{AccessControl, JobPermission, RoleAccessControl};
pub use admin::AdminControl;
pub use audit_logger::{AuditEmitter, AuditEvent, AuditSink, SqliteAuditLog};
pub use cadence::{slot_dedupe_key, Cadence, Schedule, ScheduleDefinition};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::JobContext;
pub use engine::{
    EngineSettings, JobEngine, JobEngineBuilder, PollReport, AUDIT_DB_FILE, JOBS_DB_FILE,
};
pub use error::{EngineError, HandlerError};
pub use job_store::{JobDb, JobStore, SqliteJobStore};
pub use lock_manager::{LockManager, LockRecord, SqliteLockManager, GLOBAL_LOCK_KEY};
pub use models::{Actor, ActorRole, Job, JobFilter, JobId, JobStatus, Payload};
pub use registry::{ConcurrencyKey, HandlerOptions, JobHandler};
pub use retry_policy::{FailureCause, RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY_SECS};
pub use session::{LoggingSessionGate, SessionGate};
