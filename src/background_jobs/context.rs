use super::models::JobId;
use tokio_util::sync::CancellationToken;

/// Context handed to a handler for one attempt.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: String,
    /// 1-based number of this attempt.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Cancelled when the engine shuts down.
    pub cancellation_token: CancellationToken,
}

impl JobContext {
    /// Check if shutdown has been requested.
    ///
    /// Long handlers should poll this and return `HandlerError::Cancelled`.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
