//! Job types shipped with the engine.

pub mod database_backup;

pub use database_backup::{
    DatabaseBackupJob, DATABASE_BACKUP_JOB_TYPE, DATABASE_BACKUP_SCHEDULE, MIN_RETENTION_COUNT,
};
