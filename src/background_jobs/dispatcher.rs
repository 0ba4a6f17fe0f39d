//! Claims due jobs under their locks and runs them on the blocking pool.
//!
//! A job only reaches Running after its lock key was acquired for the claim's
//! run token. The lease is renewed while the handler runs and released once
//! the outcome is recorded, whatever the outcome.

use super::context::JobContext;
use super::engine::EngineCore;
use super::error::EngineError;
use super::models::{Actor, Job, JobId, JobStatus, Payload};
use super::registry::RegisteredHandler;
use super::retry_policy::FailureCause;
use crate::metrics;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const ORPHANED_MESSAGE: &str = "Orphaned: lease expired before the run reported an outcome";

pub(crate) struct Dispatcher {
    core: Arc<EngineCore>,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub(crate) fn new(core: Arc<EngineCore>, shutdown: CancellationToken) -> Self {
        let workers = Arc::new(Semaphore::new(core.settings.max_workers.max(1)));
        Self {
            core,
            workers,
            tracker: TaskTracker::new(),
            shutdown,
        }
    }

    // === Recovery ===

    /// Drop expired leases and fail the Running jobs they were guarding.
    ///
    /// Returns how many jobs were recovered.
    pub(crate) fn recover_orphans(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        for lock in self.core.locks.expired(now)? {
            if !self.core.locks.reclaim(&lock, now)? {
                continue;
            }
            warn!(
                "Reclaimed expired lock {} held by {} since {}",
                lock.key, lock.holder, lock.acquired_at
            );
            if lock.is_global() {
                let job_id = lock.job_id.as_deref().unwrap_or("unknown");
                let job_type = match self.core.store.get(job_id) {
                    Ok(Some(job)) => job.job_type,
                    _ => "unknown".to_string(),
                };
                self.core.resume_sessions(&job_type, job_id);
            }
        }

        let mut recovered = 0;
        for job in self.core.store.running_jobs()? {
            let Some(token) = job.run_token.clone() else {
                warn!("Running job {} has no run token, leaving it alone", job.id);
                continue;
            };
            let lease_alive = self
                .core
                .locks
                .held_by(&token)?
                .is_some_and(|lock| !lock.is_expired(now));
            if lease_alive {
                continue;
            }

            warn!(
                "Job {} ({}) lost its lease while Running, recovering",
                job.id, job.job_type
            );
            match self
                .core
                .record_failure(&job, &token, FailureCause::Orphaned, ORPHANED_MESSAGE)
            {
                Ok(true) => {
                    recovered += 1;
                    metrics::record_orphan_recovered(&job.job_type);
                }
                Ok(false) => debug!("Job {} settled before it could be recovered", job.id),
                Err(e) => error!("Failed to recover orphaned job {}: {}", job.id, e),
            }
        }
        Ok(recovered)
    }

    // === Dispatch ===

    /// Start as many due jobs as there are free workers and free lock keys.
    ///
    /// A job whose key is held stays Queued untouched and is looked at again on
    /// the next poll.
    pub(crate) fn dispatch_due(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        if self.shutdown.is_cancelled() {
            return Ok(0);
        }

        let candidates = self.core.store.due_jobs(now, self.core.settings.poll_batch)?;
        let mut tried_keys: HashSet<String> = HashSet::new();
        let mut started = 0;

        for job in candidates {
            let Some(handler) = self.core.registry.get(&job.job_type) else {
                warn!(
                    "No handler registered for job type {}, job {} stays queued",
                    job.job_type, job.id
                );
                continue;
            };
            if !tried_keys.insert(handler.lock_key.clone()) {
                continue;
            }
            let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() else {
                debug!("All workers busy, remaining due jobs wait for the next poll");
                break;
            };

            let run_token = self.core.new_run_token();
            match self.core.acquire_lock(&handler, &run_token, &job.id, now) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        "Lock {} is held, job {} ({}) stays queued",
                        handler.lock_key, job.id, job.job_type
                    );
                    continue;
                }
                Err(e) => {
                    error!("Failed to acquire lock {}: {}", handler.lock_key, e);
                    continue;
                }
            }

            match self.claim(&job, &run_token, now) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Job {} was claimed or cancelled elsewhere", job.id);
                    self.core.release_lock(&handler, &run_token, &job.id);
                    continue;
                }
                Err(e) => {
                    error!("Failed to claim job {}: {}", job.id, e);
                    self.core.release_lock(&handler, &run_token, &job.id);
                    continue;
                }
            }

            started += 1;
            self.spawn_execution(running_copy(job, &run_token, now), handler, run_token, permit);
        }
        Ok(started)
    }

    /// Create a job and start it immediately under its lock.
    ///
    /// The lock comes first: a held key is rejected before any record or
    /// worker slot is touched.
    pub(crate) async fn run_now(
        &self,
        job_type: &str,
        payload: Payload,
        actor: &Actor,
    ) -> Result<JobId, EngineError> {
        let handler = self.core.registry.require(job_type)?;
        let now = self.core.now();
        let job = Job::new_queued(job_type, payload, None, handler.max_attempts, actor, now);
        let run_token = self.core.new_run_token();

        if !self.core.acquire_lock(&handler, &run_token, &job.id, now)? {
            info!(
                "Rejected manual run of {} by {}: lock {} is held",
                job_type, actor, handler.lock_key
            );
            return Err(EngineError::LockContention {
                key: handler.lock_key.clone(),
            });
        }

        let permit = match self.reserve_worker(&handler, &run_token).await {
            Ok(permit) => permit,
            Err(e) => {
                self.core.release_lock(&handler, &run_token, &job.id);
                return Err(e);
            }
        };

        let started_at = self.core.now();
        let hook = self.core.audit.on_created(Some("manual run".to_string()));
        let claimed = self
            .core
            .store
            .insert(&job, &hook)
            .map_err(EngineError::from_store)
            .and_then(|_| self.claim(&job, &run_token, started_at));

        match claimed {
            Ok(true) => {
                info!("Manual run of {} started as job {} by {}", job_type, job.id, actor);
                let job_id = job.id.clone();
                self.spawn_execution(
                    running_copy(job, &run_token, started_at),
                    handler,
                    run_token,
                    permit,
                );
                Ok(job_id)
            }
            Ok(false) => {
                self.core.release_lock(&handler, &run_token, &job.id);
                let status = match self.core.store.get(&job.id) {
                    Ok(Some(current)) => current.status,
                    _ => JobStatus::Cancelled,
                };
                warn!("Manual run {} of {} never started, it is {}", job.id, job_type, status);
                Err(EngineError::InvalidTransition {
                    job_id: job.id,
                    status,
                    action: "start",
                })
            }
            Err(e) => {
                self.core.release_lock(&handler, &run_token, &job.id);
                Err(e)
            }
        }
    }

    /// Take a worker slot for a run that already holds its lock.
    ///
    /// While every worker is busy the lease is renewed, and the run only goes
    /// ahead if it still holds the lock once a slot frees up.
    async fn reserve_worker(
        &self,
        handler: &RegisteredHandler,
        run_token: &str,
    ) -> Result<OwnedSemaphorePermit, EngineError> {
        if let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() {
            return Ok(permit);
        }
        info!(
            "All workers busy, manual run holds lock {} until one frees up",
            handler.lock_key
        );

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(renew_lease(
            Arc::clone(&self.core),
            handler.lock_key.clone(),
            run_token.to_string(),
            heartbeat_stop.clone(),
        ));
        let acquired = tokio::select! {
            permit = Arc::clone(&self.workers).acquire_owned() => {
                permit.map_err(|_| EngineError::Store(anyhow!("Worker pool is closed")))
            }
            _ = self.shutdown.cancelled() => {
                Err(EngineError::Store(anyhow!("Engine is shutting down")))
            }
        };
        heartbeat_stop.cancel();
        let _ = heartbeat.await;
        let permit = acquired?;

        let now = self.core.now();
        let still_held = self
            .core
            .locks
            .held_by(run_token)?
            .is_some_and(|lock| lock.key == handler.lock_key && !lock.is_expired(now));
        if !still_held {
            warn!("Lease {} lost while waiting for a worker", handler.lock_key);
            return Err(EngineError::LockContention {
                key: handler.lock_key.clone(),
            });
        }
        Ok(permit)
    }

    fn claim(&self, job: &Job, run_token: &str, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let actor = Actor::system("dispatcher");
        let hook =
            self.core
                .audit
                .on_transition(JobStatus::Queued, JobStatus::Running, &actor.name, now, None);
        self.core
            .store
            .claim(&job.id, run_token, now, &hook)
            .map_err(EngineError::from_store)
    }

    fn spawn_execution(
        &self,
        job: Job,
        handler: Arc<RegisteredHandler>,
        run_token: String,
        permit: OwnedSemaphorePermit,
    ) {
        let core = Arc::clone(&self.core);
        let cancellation_token = self.shutdown.child_token();
        self.tracker.spawn(async move {
            let _permit = permit;
            execute(core, job, handler, run_token, cancellation_token).await;
        });
    }

    // === Lifecycle ===

    pub(crate) async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Stop dispatching and wait up to `timeout` for running handlers.
    pub(crate) async fn shutdown(&self, timeout: Duration) {
        self.shutdown.cancel();
        self.tracker.close();
        if !self.tracker.is_empty() {
            info!("Waiting for {} running jobs to finish", self.tracker.len());
        }
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(
                "Timed out waiting for running jobs; their leases will expire and they will be recovered"
            );
        }
    }
}

fn running_copy(mut job: Job, run_token: &str, now: DateTime<Utc>) -> Job {
    job.status = JobStatus::Running;
    job.started_at = Some(now);
    job.run_token = Some(run_token.to_string());
    job
}

async fn execute(
    core: Arc<EngineCore>,
    job: Job,
    handler: Arc<RegisteredHandler>,
    run_token: String,
    cancellation_token: CancellationToken,
) {
    let ctx = JobContext {
        job_id: job.id.clone(),
        job_type: job.job_type.clone(),
        attempt: job.attempt_count + 1,
        max_attempts: job.max_attempts,
        cancellation_token,
    };
    info!(
        "Executing job {} ({}), attempt {}/{}",
        job.id, job.job_type, ctx.attempt, ctx.max_attempts
    );
    metrics::set_job_running(&job.job_type, true);

    let heartbeat_stop = CancellationToken::new();
    let heartbeat = tokio::spawn(renew_lease(
        Arc::clone(&core),
        handler.lock_key.clone(),
        run_token.clone(),
        heartbeat_stop.clone(),
    ));

    let started = Instant::now();
    let runner = Arc::clone(&handler.handler);
    let payload = job.payload.clone();
    let result = tokio::task::spawn_blocking(move || runner.execute(&ctx, &payload)).await;
    let elapsed = started.elapsed();

    heartbeat_stop.cancel();
    let _ = heartbeat.await;

    let outcome = match result {
        Ok(Ok(())) => {
            record_completion(&core, &job, &run_token);
            "success"
        }
        Ok(Err(e)) => {
            record_attempt_failure(&core, &job, &run_token, FailureCause::Handler, &e.to_string());
            "failed"
        }
        Err(join_error) => {
            let message = format!("Task panic: {}", join_error);
            record_attempt_failure(&core, &job, &run_token, FailureCause::Panicked, &message);
            "panic"
        }
    };

    core.release_lock(&handler, &run_token, &job.id);
    metrics::set_job_running(&job.job_type, false);
    metrics::record_job_execution(&job.job_type, outcome, elapsed);
}

fn record_completion(core: &EngineCore, job: &Job, run_token: &str) {
    let now = core.now();
    let actor = Actor::system("dispatcher");
    let hook =
        core.audit
            .on_transition(JobStatus::Running, JobStatus::Completed, &actor.name, now, None);
    match core.store.complete(&job.id, run_token, now, &hook) {
        Ok(true) => info!("Job {} ({}) completed", job.id, job.job_type),
        Ok(false) => warn!(
            "Job {} finished after its claim was recovered, outcome ignored",
            job.id
        ),
        Err(e) => error!(
            "Failed to record completion of job {}: {}",
            job.id,
            EngineError::from_store(e)
        ),
    }
}

fn record_attempt_failure(
    core: &EngineCore,
    job: &Job,
    run_token: &str,
    cause: FailureCause,
    message: &str,
) {
    match core.record_failure(job, run_token, cause, message) {
        Ok(true) => {}
        Ok(false) => warn!(
            "Job {} failed after its claim was recovered, outcome ignored",
            job.id
        ),
        Err(e) => error!("Failed to record failure of job {}: {}", job.id, e),
    }
}

/// Keep the lease alive while the handler runs.
async fn renew_lease(
    core: Arc<EngineCore>,
    lock_key: String,
    holder: String,
    stop: CancellationToken,
) {
    let ttl = core.settings.lease_ttl;
    let period = (ttl / 3)
        .to_std()
        .unwrap_or(Duration::from_secs(1))
        .max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                match core.locks.renew(&lock_key, &holder, ttl, core.now()) {
                    Ok(true) => debug!("Renewed lease {} for {}", lock_key, holder),
                    Ok(false) => {
                        warn!("Lease {} for {} was lost while the job was running", lock_key, holder);
                        break;
                    }
                    Err(e) => warn!("Failed to renew lease {}: {:#}", lock_key, e),
                }
            }
        }
    }
}
