//! Configuration for the flow engine.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Directory under the home directory holding engine data.
const DATA_DIR_NAME: &str = ".ledgerflow";

/// Database filename under the data directory.
const DATABASE_NAME: &str = "flows.db";

/// Flow engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Time before an unacknowledged session message is resent.
    #[serde(with = "duration_millis")]
    pub session_resend_window: Duration,

    /// Time before an unanswered external request is resent.
    #[serde(with = "duration_millis")]
    pub external_resend_window: Duration,

    /// Transient failures tolerated for one flow before it is failed.
    pub max_retry_attempts: u32,

    /// Pause before a transiently failed event is redelivered.
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,

    /// Flow logic steps allowed in one pipeline run.
    pub max_fiber_steps: u32,

    /// Worker partitions; each processes its flows sequentially.
    pub partitions: usize,

    /// Output records relayed per batch.
    pub relay_batch_size: usize,

    /// How long a terminated flow keeps answering late session messages.
    #[serde(with = "duration_millis")]
    pub tombstone_retention: Duration,

    /// Path of the SQLite checkpoint database.
    pub database_path: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_resend_window: Duration::from_secs(5),
            external_resend_window: Duration::from_secs(10),
            max_retry_attempts: 5,
            retry_delay: Duration::from_millis(200),
            max_fiber_steps: 1000,
            partitions: 4,
            relay_batch_size: 100,
            tombstone_retention: Duration::from_secs(7 * 24 * 60 * 60),
            database_path: default_database_path(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

fn default_database_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DATA_DIR_NAME).join(DATABASE_NAME))
        .unwrap_or_else(|| PathBuf::from(DATABASE_NAME))
}

impl EngineConfig {
    /// Defaults overridden from the environment.
    pub fn new() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.load_from_env()?;
        Ok(config)
    }

    /// Load configuration from a file, then apply environment overrides.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific JSON file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Override configuration from `LEDGERFLOW_*` environment variables.
    pub fn load_from_env(&mut self) -> ConfigResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        if let Some(ms) = parse_var::<u64>(&var, "LEDGERFLOW_SESSION_RESEND_MS")? {
            self.session_resend_window = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&var, "LEDGERFLOW_EXTERNAL_RESEND_MS")? {
            self.external_resend_window = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&var, "LEDGERFLOW_MAX_RETRY_ATTEMPTS")? {
            self.max_retry_attempts = n;
        }
        if let Some(ms) = parse_var::<u64>(&var, "LEDGERFLOW_RETRY_DELAY_MS")? {
            self.retry_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&var, "LEDGERFLOW_MAX_FIBER_STEPS")? {
            self.max_fiber_steps = n;
        }
        if let Some(n) = parse_var(&var, "LEDGERFLOW_PARTITIONS")? {
            self.partitions = n;
        }
        if let Some(n) = parse_var(&var, "LEDGERFLOW_RELAY_BATCH_SIZE")? {
            self.relay_batch_size = n;
        }
        if let Some(secs) = parse_var::<u64>(&var, "LEDGERFLOW_TOMBSTONE_RETENTION_SECS")? {
            self.tombstone_retention = Duration::from_secs(secs);
        }
        if let Some(path) = var("LEDGERFLOW_DATABASE") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(level) = var("LEDGERFLOW_LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.partitions == 0 {
            return Err(ConfigError::Invalid("partitions must be at least 1".into()));
        }
        if self.relay_batch_size == 0 {
            return Err(ConfigError::Invalid("relay_batch_size must be at least 1".into()));
        }
        if self.tombstone_retention < self.session_resend_window {
            return Err(ConfigError::Invalid(
                "tombstone_retention must not be shorter than session_resend_window".into(),
            ));
        }
        if self.max_fiber_steps == 0 {
            return Err(ConfigError::Invalid("max_fiber_steps must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> ConfigResult<Option<T>> {
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{} has invalid value {:?}", key, raw))),
        None => Ok(None),
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.session_resend_window, Duration::from_secs(5));
        assert_eq!(config.max_retry_attempts, 5);
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert!(config.database_path.ends_with(DATABASE_NAME));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file_with_partial_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"session_resend_window": 250, "partitions": 2}"#).unwrap();

        let config = EngineConfig::load_from_file(&path).unwrap();
        assert_eq!(config.session_resend_window, Duration::from_millis(250));
        assert_eq!(config.partitions, 2);
        assert_eq!(config.relay_batch_size, 100);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LEDGERFLOW_EXTERNAL_RESEND_MS", "1500"),
            ("LEDGERFLOW_MAX_RETRY_ATTEMPTS", "2"),
            ("LEDGERFLOW_DATABASE", "/tmp/x.db"),
            ("LEDGERFLOW_TOMBSTONE_RETENTION_SECS", "3600"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.external_resend_window, Duration::from_millis(1500));
        assert_eq!(config.max_retry_attempts, 2);
        assert_eq!(config.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.tombstone_retention, Duration::from_secs(3600));
    }

    #[test]
    fn test_retention_shorter_than_resend_window_is_invalid() {
        let config = EngineConfig {
            tombstone_retention: Duration::from_secs(1),
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut config = EngineConfig::default();
        let result = config.apply_overrides(|key| (key == "LEDGERFLOW_PARTITIONS").then(|| "many".to_string()));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_partitions_is_invalid() {
        let config = EngineConfig {
            partitions: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_round_trip() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
