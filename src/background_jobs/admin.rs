//! Operator surface: list, inspect, retry and cancel jobs, toggle schedules.
//!
//! Every operation checks the actor's permission before touching anything, and
//! every state change is audited in the same transaction that applies it.

use super::access::JobPermission;
use super::cadence::Schedule;
use super::engine::EngineCore;
use super::error::EngineError;
use super::models::{Actor, Job, JobFilter, JobStatus};
use std::sync::Arc;
use tracing::info;

pub struct AdminControl {
    core: Arc<EngineCore>,
}

impl AdminControl {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }

    pub fn list(&self, actor: &Actor, filter: &JobFilter) -> Result<Vec<Job>, EngineError> {
        self.core.authorize(actor, JobPermission::ViewJobs)?;
        Ok(self.core.store.list(filter)?)
    }

    pub fn get(&self, actor: &Actor, job_id: &str) -> Result<Job, EngineError> {
        self.core.authorize(actor, JobPermission::ViewJobs)?;
        self.load(job_id)
    }

    /// Put a Failed job back in the queue, due immediately.
    ///
    /// The attempt count is kept, so the job gets exactly one more attempt
    /// before it fails again.
    pub fn retry(&self, actor: &Actor, job_id: &str) -> Result<Job, EngineError> {
        self.core.authorize(actor, JobPermission::RetryJobs)?;
        let now = self.core.now();
        let hook = self.core.audit.on_transition(
            JobStatus::Failed,
            JobStatus::Queued,
            &actor.name,
            now,
            Some("manual retry".to_string()),
        );
        let applied = self
            .core
            .store
            .requeue_failed(job_id, &hook)
            .map_err(EngineError::from_store)?;
        if !applied {
            return Err(self.rejected(job_id, "retry"));
        }
        info!("Job {} requeued by {}", job_id, actor);
        self.load(job_id)
    }

    /// Cancel a Queued job. Running and terminal jobs cannot be cancelled.
    pub fn cancel(&self, actor: &Actor, job_id: &str) -> Result<Job, EngineError> {
        self.core.authorize(actor, JobPermission::CancelJobs)?;
        let now = self.core.now();
        let hook = self.core.audit.on_transition(
            JobStatus::Queued,
            JobStatus::Cancelled,
            &actor.name,
            now,
            Some("cancelled by operator".to_string()),
        );
        let applied = self
            .core
            .store
            .cancel(job_id, now, &hook)
            .map_err(EngineError::from_store)?;
        if !applied {
            return Err(self.rejected(job_id, "cancel"));
        }
        info!("Job {} cancelled by {}", job_id, actor);
        self.load(job_id)
    }

    pub fn list_schedules(&self, actor: &Actor) -> Result<Vec<Schedule>, EngineError> {
        self.core.authorize(actor, JobPermission::ViewJobs)?;
        Ok(self.core.store.list_schedules()?)
    }

    /// Pause or resume a schedule. Slots passed while paused collapse into a
    /// single job once it is resumed.
    pub fn set_schedule_enabled(
        &self,
        actor: &Actor,
        name: &str,
        enabled: bool,
    ) -> Result<Schedule, EngineError> {
        self.core.authorize(actor, JobPermission::ManageSchedules)?;
        if !self
            .core
            .store
            .set_schedule_enabled(name, enabled, self.core.now())?
        {
            return Err(EngineError::NotFound(name.to_string()));
        }
        info!(
            "Schedule {} {} by {}",
            name,
            if enabled { "enabled" } else { "disabled" },
            actor
        );
        self.core
            .store
            .get_schedule(name)?
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }

    fn load(&self, job_id: &str) -> Result<Job, EngineError> {
        self.core
            .store
            .get(job_id)?
            .ok_or_else(|| EngineError::NotFound(job_id.to_string()))
    }

    /// Error for a transition that did not apply.
    fn rejected(&self, job_id: &str, action: &'static str) -> EngineError {
        match self.load(job_id) {
            Ok(job) => EngineError::InvalidTransition {
                job_id: job.id,
                status: job.status,
                action,
            },
            Err(e) => e,
        }
    }
}
