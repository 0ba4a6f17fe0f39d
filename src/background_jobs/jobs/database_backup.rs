//! Database backup background job.
//!
//! Writes a consistent snapshot of the jobs database with `VACUUM INTO` and
//! keeps the newest `retention_count` snapshots. Runs under the global lock,
//! so user sessions are read-only while it works.

use crate::background_jobs::{
    cadence::{Cadence, ScheduleDefinition},
    context::JobContext,
    engine::JobEngine,
    error::{EngineError, HandlerError},
    models::Payload,
    registry::{HandlerOptions, JobHandler},
};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const DATABASE_BACKUP_JOB_TYPE: &str = "database_backup";
pub const DATABASE_BACKUP_SCHEDULE: &str = "nightly_database_backup";

/// Fewer snapshots than this are never kept.
pub const MIN_RETENTION_COUNT: usize = 5;

const BACKUP_PREFIX: &str = "backup_";
const BACKUP_SUFFIX: &str = ".db";

pub struct DatabaseBackupJob {
    source_db: PathBuf,
    backup_dir: PathBuf,
    retention_count: usize,
}

impl DatabaseBackupJob {
    pub fn new(source_db: PathBuf, backup_dir: PathBuf, retention_count: usize) -> Self {
        Self {
            source_db,
            backup_dir,
            retention_count: retention_count.max(MIN_RETENTION_COUNT),
        }
    }

    /// Register the handler as globally exclusive and, if `schedule_time` is
    /// set, a daily schedule at that UTC time.
    pub fn register(self, engine: &JobEngine, schedule_time: Option<&str>) -> Result<(), EngineError> {
        engine.register(
            DATABASE_BACKUP_JOB_TYPE,
            Arc::new(self),
            HandlerOptions::default().globally_exclusive(),
        )?;
        if let Some(time) = schedule_time {
            let cadence =
                Cadence::daily_at(time).map_err(|e| EngineError::Configuration(format!("{:#}", e)))?;
            engine.upsert_schedule(ScheduleDefinition::new(
                DATABASE_BACKUP_SCHEDULE,
                DATABASE_BACKUP_JOB_TYPE,
                cadence,
            ))?;
        }
        Ok(())
    }

    /// Existing snapshots, oldest first.
    pub fn backups(&self) -> Result<Vec<PathBuf>> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }
        let mut backups: Vec<PathBuf> = std::fs::read_dir(&self.backup_dir)
            .with_context(|| format!("Failed to read backup directory {:?}", self.backup_dir))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_backup_file(path))
            .collect();
        // Names embed the timestamp, so name order is age order.
        backups.sort();
        Ok(backups)
    }

    fn snapshot(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.backup_dir)
            .with_context(|| format!("Failed to create backup directory {:?}", self.backup_dir))?;

        let file_name = format!(
            "{}{}{}",
            BACKUP_PREFIX,
            Utc::now().format("%Y%m%d_%H%M%S"),
            BACKUP_SUFFIX
        );
        let target = self.backup_dir.join(file_name);
        if target.exists() {
            bail!("Backup {:?} already exists", target);
        }

        let conn = Connection::open_with_flags(
            &self.source_db,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open {:?} for backup", self.source_db))?;
        conn.execute("VACUUM INTO ?1", [target.to_string_lossy().as_ref()])
            .with_context(|| format!("Failed to write snapshot {:?}", target))?;
        Ok(target)
    }

    /// Delete the oldest snapshots beyond the retention count.
    fn prune(&self) -> Result<usize> {
        let backups = self.backups()?;
        let excess = backups.len().saturating_sub(self.retention_count);
        for path in &backups[..excess] {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to delete old backup {:?}", path))?;
            debug!("Deleted old backup {:?}", path);
        }
        Ok(excess)
    }
}

fn is_backup_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(BACKUP_PREFIX) && name.ends_with(BACKUP_SUFFIX))
}

impl JobHandler for DatabaseBackupJob {
    fn execute(&self, ctx: &JobContext, _payload: &Payload) -> Result<(), HandlerError> {
        if ctx.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }

        info!("Backing up {:?} into {:?}", self.source_db, self.backup_dir);
        let target = self.snapshot()?;
        let size = std::fs::metadata(&target).map(|m| m.len()).unwrap_or(0);
        info!("Wrote backup {:?} ({} bytes)", target, size);

        let pruned = self.prune()?;
        if pruned > 0 {
            info!(
                "Deleted {} old backups, keeping the newest {}",
                pruned, self.retention_count
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> JobContext {
        JobContext {
            job_id: "job-1".to_string(),
            job_type: DATABASE_BACKUP_JOB_TYPE.to_string(),
            attempt: 1,
            max_attempts: 5,
            cancellation_token: CancellationToken::new(),
        }
    }

    fn source_db(dir: &Path) -> PathBuf {
        let path = dir.join("jobs.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)", [])
            .unwrap();
        conn.execute("INSERT INTO items (name) VALUES (?1)", params!["first"])
            .unwrap();
        path
    }

    #[test]
    fn test_backup_writes_readable_snapshot() {
        let dir = TempDir::new().unwrap();
        let job = DatabaseBackupJob::new(source_db(dir.path()), dir.path().join("backups"), 10);

        job.execute(&ctx(), &Payload::empty()).unwrap();

        let backups = job.backups().unwrap();
        assert_eq!(backups.len(), 1);
        let conn = Connection::open(&backups[0]).unwrap();
        let name: String = conn
            .query_row("SELECT name FROM items", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "first");
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let backup_dir = dir.path().join("backups");
        std::fs::create_dir_all(&backup_dir).unwrap();
        for day in 1..=8 {
            std::fs::write(backup_dir.join(format!("backup_202401{:02}_020000.db", day)), b"x")
                .unwrap();
        }
        std::fs::write(backup_dir.join("notes.txt"), b"keep me").unwrap();

        let job = DatabaseBackupJob::new(dir.path().join("jobs.db"), backup_dir.clone(), 5);
        assert_eq!(job.prune().unwrap(), 3);

        let remaining = job.backups().unwrap();
        assert_eq!(remaining.len(), 5);
        assert!(remaining[0].ends_with("backup_20240104_020000.db"));
        assert!(backup_dir.join("notes.txt").exists());
    }

    #[test]
    fn test_retention_has_a_floor() {
        let job = DatabaseBackupJob::new(PathBuf::from("a.db"), PathBuf::from("b"), 1);
        assert_eq!(job.retention_count, MIN_RETENTION_COUNT);
    }

    #[test]
    fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let job = DatabaseBackupJob::new(source_db(dir.path()), dir.path().join("backups"), 10);
        let ctx = ctx();
        ctx.cancellation_token.cancel();

        assert!(matches!(
            job.execute(&ctx, &Payload::empty()),
            Err(HandlerError::Cancelled)
        ));
        assert!(job.backups().unwrap().is_empty());
    }

    #[test]
    fn test_missing_source_fails() {
        let dir = TempDir::new().unwrap();
        let job = DatabaseBackupJob::new(
            dir.path().join("missing.db"),
            dir.path().join("backups"),
            10,
        );
        assert!(matches!(
            job.execute(&ctx(), &Payload::empty()),
            Err(HandlerError::ExecutionFailed(_))
        ));
    }
}
