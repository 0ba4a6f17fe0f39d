use anyhow::Result;
use tracing::info;

/// Session/activity collaborator notified around globally exclusive runs.
///
/// `freeze_writes` is called right after the global lock is acquired and
/// `resume_writes` right after it is released or reclaimed, whatever the job
/// outcome.
pub trait SessionGate: Send + Sync {
    fn freeze_writes(&self, job_type: &str, job_id: &str) -> Result<()>;
    fn resume_writes(&self, job_type: &str, job_id: &str) -> Result<()>;
}

/// Gate used when no session manager is wired in: it only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSessionGate;

impl SessionGate for LoggingSessionGate {
    fn freeze_writes(&self, job_type: &str, job_id: &str) -> Result<()> {
        info!(
            "Sessions switched to read-only while {} ({}) holds the global lock",
            job_type, job_id
        );
        Ok(())
    }

    fn resume_writes(&self, job_type: &str, job_id: &str) -> Result<()> {
        info!(
            "Sessions resumed after {} ({}) released the global lock",
            job_type, job_id
        );
        Ok(())
    }
}
