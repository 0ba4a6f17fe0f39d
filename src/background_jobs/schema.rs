//! Database schemas for jobs.db and job_audit.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{SqlType, Table, VersionedSchema};

// =============================================================================
// jobs.db - Version 0
// =============================================================================

/// Every job ever created. Rows are never deleted.
const JOBS_TABLE_V0: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("job_type", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("payload", &SqlType::Blob, non_null = true),
        sqlite_column!("scheduled_at", &SqlType::Integer),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("completed_at", &SqlType::Integer),
        sqlite_column!(
            "attempt_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("max_attempts", &SqlType::Integer, non_null = true),
        sqlite_column!("last_error", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("created_by", &SqlType::Text, non_null = true),
        sqlite_column!("dedupe_key", &SqlType::Text),
        sqlite_column!("run_token", &SqlType::Text),
    ],
    indices: &[
        ("idx_jobs_status_due", "status, scheduled_at"),
        ("idx_jobs_type_status", "job_type, status, created_at"),
        ("idx_jobs_created", "created_at"),
    ],
    unique_constraints: &[&["dedupe_key"]],
};

/// Schedule definitions with their catch-up marker.
const JOB_SCHEDULES_TABLE_V0: Table = Table {
    name: "job_schedules",
    columns: &[
        sqlite_column!("name", &SqlType::Text, is_primary_key = true),
        sqlite_column!("job_type", &SqlType::Text, non_null = true),
        sqlite_column!("cadence", &SqlType::Text, non_null = true),
        sqlite_column!("payload", &SqlType::Blob, non_null = true),
        sqlite_column!(
            "enabled",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("1")
        ),
        sqlite_column!("last_slot", &SqlType::Integer),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

/// One row per held concurrency key.
const JOB_LOCKS_TABLE_V0: Table = Table {
    name: "job_locks",
    columns: &[
        sqlite_column!("lock_key", &SqlType::Text, is_primary_key = true),
        sqlite_column!("holder", &SqlType::Text, non_null = true),
        sqlite_column!("job_id", &SqlType::Text),
        sqlite_column!("acquired_at", &SqlType::Integer, non_null = true),
        sqlite_column!("expires_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_job_locks_expiry", "expires_at"),
        ("idx_job_locks_job", "job_id"),
    ],
    unique_constraints: &[],
};

pub const JOBS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[JOBS_TABLE_V0, JOB_SCHEDULES_TABLE_V0, JOB_LOCKS_TABLE_V0],
    migration: None,
}];

// =============================================================================
// job_audit.db - Version 0
// =============================================================================

/// Append-only transition log.
const JOB_AUDIT_LOG_TABLE_V0: Table = Table {
    name: "job_audit_log",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("job_id", &SqlType::Text, non_null = true),
        sqlite_column!("from_status", &SqlType::Text),
        sqlite_column!("to_status", &SqlType::Text, non_null = true),
        sqlite_column!("actor", &SqlType::Text, non_null = true),
        sqlite_column!("timestamp", &SqlType::Integer, non_null = true),
        sqlite_column!("reason", &SqlType::Text),
    ],
    indices: &[
        ("idx_job_audit_job", "job_id"),
        ("idx_job_audit_timestamp", "timestamp"),
    ],
    unique_constraints: &[],
};

pub const JOB_AUDIT_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[JOB_AUDIT_LOG_TABLE_V0],
    migration: None,
}];

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_jobs_schema_creates_and_validates() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = JOBS_VERSIONED_SCHEMAS.last().unwrap();
        schema.create(&conn).expect("jobs schema should create");
        schema.validate(&conn).expect("jobs schema should validate");
    }

    #[test]
    fn test_audit_schema_creates_and_validates() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = JOB_AUDIT_VERSIONED_SCHEMAS.last().unwrap();
        schema.create(&conn).unwrap();
        schema.validate(&conn).unwrap();
    }

    #[test]
    fn test_dedupe_key_is_unique_but_nullable() {
        let conn = Connection::open_in_memory().unwrap();
        JOBS_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        let insert = |id: &str, key: Option<&str>| {
            conn.execute(
                "INSERT INTO jobs (id, job_type, status, payload, max_attempts, created_at, created_by, dedupe_key)
                 VALUES (?1, 'backup', 'QUEUED', x'', 5, 0, 'test', ?2)",
                rusqlite::params![id, key],
            )
        };

        insert("a", None).unwrap();
        insert("b", None).unwrap();
        insert("c", Some("backup@60")).unwrap();
        assert!(insert("d", Some("backup@60")).is_err());
    }
}
