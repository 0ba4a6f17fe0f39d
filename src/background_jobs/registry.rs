//! Handler registration.
//!
//! Each owning subsystem registers its job types once at startup. The registry
//! resolves a job type to its handler, its attempt ceiling and the lock key
//! under which its runs are mutually exclusive.

use super::context::JobContext;
use super::error::{EngineError, HandlerError};
use super::lock_manager::GLOBAL_LOCK_KEY;
use super::models::Payload;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Work behind a job type.
///
/// Handlers run on a blocking thread. The payload is whatever the submitter
/// stored; only the handler knows how to read it.
pub trait JobHandler: Send + Sync {
    fn execute(&self, ctx: &JobContext, payload: &Payload) -> Result<(), HandlerError>;
}

impl<F> JobHandler for F
where
    F: Fn(&JobContext, &Payload) -> Result<(), HandlerError> + Send + Sync,
{
    fn execute(&self, ctx: &JobContext, payload: &Payload) -> Result<(), HandlerError> {
        self(ctx, payload)
    }
}

/// Key under which runs of a job type exclude each other.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConcurrencyKey {
    /// One run per job type at a time.
    #[default]
    JobType,
    /// Shared with every other job type using the same name.
    Shared(String),
    /// One run at a time across all globally exclusive job types. Sessions are
    /// frozen while the lock is held.
    Global,
}

impl ConcurrencyKey {
    pub fn lock_key(&self, job_type: &str) -> String {
        match self {
            ConcurrencyKey::JobType => job_type.to_string(),
            ConcurrencyKey::Shared(key) => key.clone(),
            ConcurrencyKey::Global => GLOBAL_LOCK_KEY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Overrides the engine-wide default.
    pub max_attempts: Option<u32>,
    pub concurrency_key: ConcurrencyKey,
}

impl HandlerOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn globally_exclusive(mut self) -> Self {
        self.concurrency_key = ConcurrencyKey::Global;
        self
    }

    pub fn shared_key(mut self, key: impl Into<String>) -> Self {
        self.concurrency_key = ConcurrencyKey::Shared(key.into());
        self
    }
}

pub struct RegisteredHandler {
    pub job_type: String,
    pub handler: Arc<dyn JobHandler>,
    pub max_attempts: u32,
    pub lock_key: String,
}

impl RegisteredHandler {
    pub fn is_globally_exclusive(&self) -> bool {
        self.lock_key == GLOBAL_LOCK_KEY
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<RegisteredHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        job_type: &str,
        handler: Arc<dyn JobHandler>,
        options: HandlerOptions,
        default_max_attempts: u32,
    ) -> Result<(), EngineError> {
        if job_type.trim().is_empty() {
            return Err(EngineError::Configuration(
                "Job type must not be empty".to_string(),
            ));
        }
        let max_attempts = options.max_attempts.unwrap_or(default_max_attempts);
        if max_attempts == 0 {
            return Err(EngineError::Configuration(format!(
                "Job type {} must allow at least one attempt",
                job_type
            )));
        }
        if let ConcurrencyKey::Shared(key) = &options.concurrency_key {
            if key.is_empty() || key == GLOBAL_LOCK_KEY {
                return Err(EngineError::Configuration(format!(
                    "Job type {} uses a reserved or empty concurrency key '{}'",
                    job_type, key
                )));
            }
        }

        let lock_key = options.concurrency_key.lock_key(job_type);
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| EngineError::Configuration("Handler registry poisoned".to_string()))?;
        if handlers.contains_key(job_type) {
            return Err(EngineError::Configuration(format!(
                "Job type {} is already registered",
                job_type
            )));
        }

        info!(
            "Registering job type: {} (lock key: {}, max attempts: {})",
            job_type, lock_key, max_attempts
        );
        handlers.insert(
            job_type.to_string(),
            Arc::new(RegisteredHandler {
                job_type: job_type.to_string(),
                handler,
                max_attempts,
                lock_key,
            }),
        );
        Ok(())
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<RegisteredHandler>> {
        self.handlers
            .read()
            .ok()
            .and_then(|handlers| handlers.get(job_type).cloned())
    }

    /// Like `get`, but an unknown type is a configuration error.
    pub fn require(&self, job_type: &str) -> Result<Arc<RegisteredHandler>, EngineError> {
        self.get(job_type).ok_or_else(|| {
            EngineError::Configuration(format!("No handler registered for job type {}", job_type))
        })
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .map(|handlers| handlers.keys().cloned().collect())
            .unwrap_or_default();
        types.sort();
        types
    }
}
