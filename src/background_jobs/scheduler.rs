//! Turns schedule slots into queued jobs.
//!
//! A schedule fires at most once per evaluation, for the latest slot that has
//! passed. Slots missed while nothing was evaluating collapse into that one job.

use super::cadence::{slot_dedupe_key, Schedule};
use super::engine::EngineCore;
use super::error::EngineError;
use super::models::{Actor, Job, JobId};
use crate::metrics;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub(crate) struct Scheduler {
    core: Arc<EngineCore>,
}

impl Scheduler {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }

    /// Enqueue one job for every schedule with a due slot.
    ///
    /// A failing schedule does not stop the others; the first error is
    /// returned once all of them have been evaluated.
    pub(crate) fn tick(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, EngineError> {
        let schedules = self.core.store.list_schedules()?;
        let mut enqueued = Vec::new();
        let mut first_error = None;

        for schedule in schedules {
            let Some(slot) = schedule.due_slot(now) else {
                continue;
            };
            match self.enqueue_slot(&schedule, slot, now) {
                Ok(Some(job_id)) => enqueued.push(job_id),
                Ok(None) => {}
                Err(e) => {
                    error!(
                        "Failed to enqueue schedule {} for slot {}: {}",
                        schedule.definition.name, slot, e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(enqueued),
        }
    }

    fn enqueue_slot(
        &self,
        schedule: &Schedule,
        slot: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobId>, EngineError> {
        let definition = &schedule.definition;
        let Some(handler) = self.core.registry.get(&definition.job_type) else {
            // Marker stays put so the slot fires once the handler is registered.
            warn!(
                "Schedule {} targets unregistered job type {}, skipping",
                definition.name, definition.job_type
            );
            return Ok(None);
        };

        let job = Job::new_queued(
            &definition.job_type,
            definition.payload.clone(),
            Some(slot),
            handler.max_attempts,
            &Actor::system("scheduler"),
            now,
        )
        .with_dedupe_key(slot_dedupe_key(&definition.job_type, slot));

        let reason = match schedule.last_slot {
            Some(marker)
                if definition
                    .cadence
                    .next_slot_after(marker)
                    .is_some_and(|next| next < slot) =>
            {
                format!(
                    "schedule {} catching up on slots missed since {}",
                    definition.name, marker
                )
            }
            _ => format!("schedule {}", definition.name),
        };

        let hook = self.core.audit.on_created(Some(reason));
        let inserted = self
            .core
            .store
            .enqueue_for_slot(&definition.name, slot, &job, now, &hook)
            .map_err(EngineError::from_store)?;

        if !inserted {
            debug!(
                "Schedule {} slot {} already has a job, nothing enqueued",
                definition.name, slot
            );
            return Ok(None);
        }

        metrics::record_scheduler_enqueue(&definition.job_type);
        info!(
            "Schedule {} enqueued job {} ({}) for slot {}",
            definition.name, job.id, definition.job_type, slot
        );
        Ok(Some(job.id))
    }
}
