mod file_config;

pub use file_config::{BackupConfig, EngineConfig, FileConfig};

use crate::background_jobs::jobs::MIN_RETENTION_COUNT;
use crate::background_jobs::{
    Actor, ActorRole, Cadence, EngineSettings, RetryPolicy, AUDIT_DB_FILE, JOBS_DB_FILE,
};
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_MAX_WORKERS: usize = 4;
pub const DEFAULT_LEASE_TTL_SECS: u64 = 300;
pub const DEFAULT_METRICS_PORT: u16 = 9092;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub node_id: Option<String>,
    pub metrics_port: u16,
    pub operator: Option<String>,
    pub operator_role: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub metrics_port: u16,
    /// Identity the admin subcommands act as.
    pub operator: Actor,
    pub engine: EngineSettings,
    pub backup: BackupSettings,
}

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub enabled: bool,
    pub schedule_time: String,
    pub retention_count: usize,
    pub backup_dir: PathBuf,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;
        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let operator_name = file
            .operator
            .or_else(|| cli.operator.clone())
            .unwrap_or_else(|| "admin".to_string());
        let operator_role = match file.operator_role.or_else(|| cli.operator_role.clone()) {
            Some(role) => ActorRole::parse(&role)
                .ok_or_else(|| anyhow::anyhow!("Unknown operator role: {}", role))?,
            None => ActorRole::Admin,
        };

        let engine_file = file.engine.unwrap_or_default();
        let mut engine = EngineSettings::default();
        if let Some(node_id) = file.node_id.or_else(|| cli.node_id.clone()) {
            engine.node_id = node_id;
        }
        engine.poll_interval = Duration::from_secs(
            engine_file
                .poll_interval_secs
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
        );
        engine.max_workers = engine_file.max_workers.unwrap_or(DEFAULT_MAX_WORKERS);
        let lease_ttl_secs = engine_file.lease_ttl_secs.unwrap_or(DEFAULT_LEASE_TTL_SECS);
        let defaults = RetryPolicy::default();
        let max_attempts = engine_file
            .max_attempts
            .unwrap_or(defaults.default_max_attempts);
        let retry_delay_secs = engine_file
            .retry_delay_secs
            .unwrap_or(defaults.retry_delay.num_seconds() as u64);

        if engine.poll_interval.is_zero() {
            bail!("poll_interval_secs must be greater than 0");
        }
        if engine.max_workers == 0 {
            bail!("max_workers must be greater than 0");
        }
        if lease_ttl_secs == 0 {
            bail!("lease_ttl_secs must be greater than 0");
        }
        if max_attempts == 0 {
            bail!("max_attempts must be greater than 0");
        }
        engine.lease_ttl = chrono::Duration::seconds(lease_ttl_secs as i64);
        engine.retry = RetryPolicy::new(max_attempts, retry_delay_secs);

        let backup_file = file.backup.unwrap_or_default();
        let backup = BackupSettings {
            enabled: backup_file.enabled.unwrap_or(true),
            schedule_time: backup_file
                .schedule_time
                .unwrap_or_else(|| "02:00".to_string()),
            retention_count: backup_file.retention_count.unwrap_or(10),
            backup_dir: backup_file
                .backup_dir
                .map(PathBuf::from)
                .unwrap_or_else(|| db_dir.join("backups")),
        };
        if backup.retention_count < MIN_RETENTION_COUNT {
            bail!(
                "backup retention_count must be at least {}",
                MIN_RETENTION_COUNT
            );
        }
        Cadence::daily_at(&backup.schedule_time)?;

        Ok(Self {
            db_dir,
            metrics_port,
            operator: Actor::user(operator_name, operator_role),
            engine,
            backup,
        })
    }

    pub fn jobs_db_path(&self) -> PathBuf {
        self.db_dir.join(JOBS_DB_FILE)
    }

    pub fn audit_db_path(&self) -> PathBuf {
        self.db_dir.join(AUDIT_DB_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli_for(dir: &TempDir) -> CliConfig {
        CliConfig {
            db_dir: Some(dir.path().to_path_buf()),
            metrics_port: DEFAULT_METRICS_PORT,
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = AppConfig::resolve(&cli_for(&temp_dir), None).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.metrics_port, 9092);
        assert_eq!(config.engine.poll_interval, Duration::from_secs(5));
        assert_eq!(config.engine.max_workers, 4);
        assert_eq!(config.engine.lease_ttl, chrono::Duration::seconds(300));
        assert_eq!(config.engine.retry.default_max_attempts, 5);
        assert_eq!(config.engine.retry.retry_delay, chrono::Duration::seconds(60));
        assert!(config.backup.enabled);
        assert_eq!(config.backup.schedule_time, "02:00");
        assert_eq!(config.backup.retention_count, 10);
        assert_eq!(config.backup.backup_dir, temp_dir.path().join("backups"));
        assert_eq!(config.operator.role, ActorRole::Admin);
        assert_eq!(config.jobs_db_path(), temp_dir.path().join("jobs.db"));
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = TempDir::new().unwrap();
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/should/be/overridden")),
            node_id: Some("cli-node".to_string()),
            metrics_port: 9092,
            operator: Some("cli-user".to_string()),
            operator_role: Some("viewer".to_string()),
        };
        let file_config = FileConfig {
            db_dir: Some(temp_dir.path().to_string_lossy().to_string()),
            node_id: Some("toml-node".to_string()),
            operator_role: Some("Operator".to_string()),
            engine: Some(EngineConfig {
                max_workers: Some(2),
                retry_delay_secs: Some(120),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.engine.node_id, "toml-node");
        assert_eq!(config.engine.max_workers, 2);
        assert_eq!(config.engine.retry.retry_delay, chrono::Duration::seconds(120));
        assert_eq!(config.operator.role, ActorRole::Operator);
        // CLI value used when TOML doesn't specify
        assert_eq!(config.operator.name, "cli-user");
        assert_eq!(config.metrics_port, 9092);
    }

    #[test]
    fn test_resolve_missing_db_dir_error() {
        let result = AppConfig::resolve(&CliConfig::default(), None);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_dir must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/nonexistent/path/that/should/not/exist")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_rejects_invalid_values() {
        let temp_dir = TempDir::new().unwrap();

        let zero_ttl = FileConfig {
            engine: Some(EngineConfig {
                lease_ttl_secs: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(AppConfig::resolve(&cli_for(&temp_dir), Some(zero_ttl)).is_err());

        let low_retention = FileConfig {
            backup: Some(BackupConfig {
                retention_count: Some(3),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = AppConfig::resolve(&cli_for(&temp_dir), Some(low_retention)).unwrap_err();
        assert!(err.to_string().contains("at least 5"));

        let bad_time = FileConfig {
            backup: Some(BackupConfig {
                schedule_time: Some("25:00".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(AppConfig::resolve(&cli_for(&temp_dir), Some(bad_time)).is_err());

        let bad_role = FileConfig {
            operator_role: Some("root".to_string()),
            ..Default::default()
        };
        assert!(AppConfig::resolve(&cli_for(&temp_dir), Some(bad_role)).is_err());
    }
}
