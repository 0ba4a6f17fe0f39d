use super::models::{JobId, JobStatus};
use thiserror::Error;

/// Errors returned by the engine's public operations.
///
/// Handler failures, exhausted retries and orphaned runs never show up here:
/// they are recorded on the job and visible through listing and the audit log.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unregistered job type, invalid schedule or invalid registration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The concurrency key is held by a live lease.
    #[error("Lock '{key}' is held by another run, try again later")]
    LockContention { key: String },

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Cannot {action} job {job_id} while it is {status}")]
    InvalidTransition {
        job_id: JobId,
        status: JobStatus,
        action: &'static str,
    },

    #[error("{actor} is not allowed to {action}")]
    PermissionDenied { actor: String, action: &'static str },

    /// The audit collaborator refused the event. Operations fail closed on this.
    #[error("Audit log write failed: {0}")]
    Audit(#[source] anyhow::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, EngineError::LockContention { .. })
    }

    /// Recover an engine error that travelled through a store hook, or wrap a
    /// plain store error.
    pub(crate) fn from_store(err: anyhow::Error) -> Self {
        match err.downcast::<EngineError>() {
            Ok(engine_err) => engine_err,
            Err(other) => EngineError::Store(other),
        }
    }
}

/// Failure reported by a job handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Job was cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::ExecutionFailed(msg.into())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::ExecutionFailed(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_contention_message_is_clear() {
        let err = EngineError::LockContention {
            key: "__global__".to_string(),
        };
        assert!(err.is_lock_contention());
        assert_eq!(
            err.to_string(),
            "Lock '__global__' is held by another run, try again later"
        );
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = EngineError::InvalidTransition {
            job_id: "abc".to_string(),
            status: JobStatus::Running,
            action: "cancel",
        };
        assert_eq!(err.to_string(), "Cannot cancel job abc while it is RUNNING");

        let never_started = EngineError::InvalidTransition {
            job_id: "def".to_string(),
            status: JobStatus::Cancelled,
            action: "start",
        };
        assert_eq!(
            never_started.to_string(),
            "Cannot start job def while it is CANCELLED"
        );
    }

    #[test]
    fn test_from_store_unwraps_engine_errors() {
        let hooked = anyhow::Error::from(EngineError::Audit(anyhow::anyhow!("sink down")));
        assert!(matches!(
            EngineError::from_store(hooked),
            EngineError::Audit(_)
        ));

        let plain = anyhow::anyhow!("disk I/O error");
        assert!(matches!(
            EngineError::from_store(plain),
            EngineError::Store(_)
        ));
    }

    #[test]
    fn test_handler_error_from_anyhow_keeps_context() {
        let err: HandlerError = anyhow::anyhow!("disk full").context("writing snapshot").into();
        assert_eq!(
            err.to_string(),
            "Execution failed: writing snapshot: disk full"
        );
    }
}
