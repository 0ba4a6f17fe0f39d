use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub node_id: Option<String>,
    pub metrics_port: Option<u16>,
    pub operator: Option<String>,
    pub operator_role: Option<String>,

    // Feature configs
    pub engine: Option<EngineConfig>,
    pub backup: Option<BackupConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub poll_interval_secs: Option<u64>,
    pub max_workers: Option<usize>,
    pub lease_ttl_secs: Option<u64>,
    pub retry_delay_secs: Option<u64>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct BackupConfig {
    pub enabled: Option<bool>,
    /// "HH:MM", UTC.
    pub schedule_time: Option<String>,
    pub retention_count: Option<usize>,
    pub backup_dir: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_full_config() {
        let config: FileConfig = toml::from_str(
            r#"
            db_dir = "/var/lib/jobkeeper"
            node_id = "worker-a"
            metrics_port = 9100
            operator = "ops"
            operator_role = "operator"

            [engine]
            poll_interval_secs = 2
            max_workers = 8
            lease_ttl_secs = 120
            retry_delay_secs = 90
            max_attempts = 3

            [backup]
            enabled = false
            schedule_time = "03:30"
            retention_count = 14
            backup_dir = "/backups"
            "#,
        )
        .unwrap();

        assert_eq!(config.db_dir.as_deref(), Some("/var/lib/jobkeeper"));
        assert_eq!(config.node_id.as_deref(), Some("worker-a"));
        assert_eq!(config.metrics_port, Some(9100));
        let engine = config.engine.unwrap();
        assert_eq!(engine.max_workers, Some(8));
        assert_eq!(engine.max_attempts, Some(3));
        let backup = config.backup.unwrap();
        assert_eq!(backup.enabled, Some(false));
        assert_eq!(backup.schedule_time.as_deref(), Some("03:30"));
        assert_eq!(backup.retention_count, Some(14));
    }

    #[test]
    fn test_parse_empty_config() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert!(config.db_dir.is_none());
        assert!(config.engine.is_none());
        assert!(config.backup.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "metrics_port = 0").unwrap();
        writeln!(file, "[backup]").unwrap();
        writeln!(file, "retention_count = 7").unwrap();

        let config = FileConfig::load(file.path()).unwrap();
        assert_eq!(config.metrics_port, Some(0));
        assert_eq!(config.backup.unwrap().retention_count, Some(7));
    }

    #[test]
    fn test_load_invalid_toml_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "metrics_port = \"not a number\"").unwrap();
        let err = FileConfig::load(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }
}
