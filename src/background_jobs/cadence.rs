//! Schedule definitions and slot arithmetic.
//!
//! A slot is a minute-aligned instant at which a schedule wants a job. The
//! scheduler only ever asks for the latest slot at or before "now" and compares
//! it with the schedule's marker, so the cost of catching up after downtime does
//! not depend on how long the engine was down.

use super::models::Payload;
use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// When a schedule fires. All times are UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cadence {
    /// Fires once at the given instant (rounded down to the minute).
    Once { at: DateTime<Utc> },
    /// Fires every N minutes, aligned to the unix epoch.
    EveryMinutes { minutes: u32 },
    /// Fires every hour at the given minute.
    Hourly { minute: u32 },
    /// Fires every day at HH:MM.
    Daily { hour: u32, minute: u32 },
    /// Fires every week on the given weekday at HH:MM.
    Weekly {
        weekday: Weekday,
        hour: u32,
        minute: u32,
    },
}

const MINUTES_PER_WEEK: u32 = 7 * 24 * 60;

impl Cadence {
    /// Parse "HH:MM" into a daily cadence.
    pub fn daily_at(time: &str) -> Result<Self> {
        let parsed = NaiveTime::parse_from_str(time, "%H:%M")
            .map_err(|e| anyhow::anyhow!("Invalid time of day '{}': {}", time, e))?;
        Ok(Cadence::Daily {
            hour: chrono::Timelike::hour(&parsed),
            minute: chrono::Timelike::minute(&parsed),
        })
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Cadence::Once { .. } => {}
            Cadence::EveryMinutes { minutes } => {
                if minutes == 0 || minutes > MINUTES_PER_WEEK {
                    bail!(
                        "Interval must be between 1 and {} minutes, got {}",
                        MINUTES_PER_WEEK,
                        minutes
                    );
                }
            }
            Cadence::Hourly { minute } => check_minute(minute)?,
            Cadence::Daily { hour, minute } | Cadence::Weekly { hour, minute, .. } => {
                check_hour(hour)?;
                check_minute(minute)?;
            }
        }
        Ok(())
    }

    /// Latest slot that is at or before `now`, if any.
    ///
    /// Only `Once` can return `None` (when its instant is still in the future).
    pub fn latest_slot_at_or_before(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let now = floor_to_minute(now);
        match *self {
            Cadence::Once { at } => {
                let at = floor_to_minute(at);
                (at <= now).then_some(at)
            }
            Cadence::EveryMinutes { minutes } => {
                let step = i64::from(minutes.max(1)) * 60;
                let ts = now.timestamp();
                Utc.timestamp_opt(ts - ts.rem_euclid(step), 0).single()
            }
            Cadence::Hourly { minute } => {
                let this_hour = now.timestamp() - now.timestamp().rem_euclid(3600);
                let candidate = Utc
                    .timestamp_opt(this_hour + i64::from(minute) * 60, 0)
                    .single()?;
                Some(if candidate > now {
                    candidate - Duration::hours(1)
                } else {
                    candidate
                })
            }
            Cadence::Daily { hour, minute } => {
                let candidate = at_time_on(now, hour, minute)?;
                Some(if candidate > now {
                    candidate - Duration::days(1)
                } else {
                    candidate
                })
            }
            Cadence::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let days_back = (now.weekday().num_days_from_monday() + 7
                    - weekday.num_days_from_monday())
                    % 7;
                let candidate =
                    at_time_on(now - Duration::days(i64::from(days_back)), hour, minute)?;
                Some(if candidate > now {
                    candidate - Duration::weeks(1)
                } else {
                    candidate
                })
            }
        }
    }

    /// First slot strictly after `t`, if any.
    pub fn next_slot_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            Cadence::Once { at } => {
                let at = floor_to_minute(at);
                (at > t).then_some(at)
            }
            Cadence::EveryMinutes { minutes } => self
                .latest_slot_at_or_before(t)
                .map(|s| s + Duration::minutes(i64::from(minutes.max(1)))),
            Cadence::Hourly { .. } => self
                .latest_slot_at_or_before(t)
                .map(|s| s + Duration::hours(1)),
            Cadence::Daily { .. } => self
                .latest_slot_at_or_before(t)
                .map(|s| s + Duration::days(1)),
            Cadence::Weekly { .. } => self
                .latest_slot_at_or_before(t)
                .map(|s| s + Duration::weeks(1)),
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Cadence::Once { .. })
    }
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cadence::Once { at } => write!(f, "once at {}", at.format("%Y-%m-%d %H:%M")),
            Cadence::EveryMinutes { minutes } => write!(f, "every {} min", minutes),
            Cadence::Hourly { minute } => write!(f, "hourly at :{:02}", minute),
            Cadence::Daily { hour, minute } => write!(f, "daily at {:02}:{:02}", hour, minute),
            Cadence::Weekly {
                weekday,
                hour,
                minute,
            } => write!(f, "weekly on {} at {:02}:{:02}", weekday, hour, minute),
        }
    }
}

fn check_hour(hour: u32) -> Result<()> {
    if hour > 23 {
        bail!("Hour must be between 0 and 23, got {}", hour);
    }
    Ok(())
}

fn check_minute(minute: u32) -> Result<()> {
    if minute > 59 {
        bail!("Minute must be between 0 and 59, got {}", minute);
    }
    Ok(())
}

fn at_time_on(day: DateTime<Utc>, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    Some(Utc.from_utc_datetime(&day.date_naive().and_time(time)))
}

pub(crate) fn floor_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    let ts = t.timestamp();
    Utc.timestamp_opt(ts - ts.rem_euclid(60), 0)
        .single()
        .unwrap_or(t)
}

/// What a schedule creates and when.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleDefinition {
    /// Unique name of the schedule.
    pub name: String,
    pub job_type: String,
    pub cadence: Cadence,
    /// Payload copied into every job this schedule creates.
    pub payload: Payload,
    pub enabled: bool,
}

impl ScheduleDefinition {
    pub fn new(name: impl Into<String>, job_type: impl Into<String>, cadence: Cadence) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            cadence,
            payload: Payload::empty(),
            enabled: true,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A persisted schedule together with its catch-up marker.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub definition: ScheduleDefinition,
    /// Last slot for which a job was enqueued. Only ever moves forward.
    pub last_slot: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// The slot that should be enqueued now, if any.
    ///
    /// However many slots passed since the marker, at most one is returned: the
    /// latest. A recurring schedule never fires for slots before it was created.
    pub fn due_slot(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.definition.enabled {
            return None;
        }
        let slot = self.definition.cadence.latest_slot_at_or_before(now)?;
        match self.last_slot {
            Some(marker) => (slot > marker).then_some(slot),
            None if self.definition.cadence.is_recurring() => {
                (slot >= floor_to_minute(self.created_at)).then_some(slot)
            }
            None => Some(slot),
        }
    }

    pub fn next_run_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.definition.enabled {
            return None;
        }
        if let Some(slot) = self.due_slot(now) {
            return Some(slot);
        }
        self.definition.cadence.next_slot_after(now)
    }
}

/// Dedupe key for a job created for `slot`.
pub fn slot_dedupe_key(job_type: &str, slot: DateTime<Utc>) -> String {
    format!("{}@{}", job_type, floor_to_minute(slot).timestamp())
}
