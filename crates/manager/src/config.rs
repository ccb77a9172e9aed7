//! Service manager configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Service manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Maximum number of registered services
    pub max_services: usize,

    /// Pause between stop and start when restarting a service
    #[serde(with = "humantime_serde")]
    pub restart_settle_delay: Duration,

    /// Upper bound on stopping all services during shutdown
    #[serde(with = "humantime_serde")]
    pub dispose_timeout: Duration,

    /// Per-service health check timeout, unbounded when unset
    #[serde(with = "humantime_serde")]
    pub health_check_timeout: Option<Duration>,

    /// Resident memory above which a memory-pressure recommendation is emitted
    pub memory_pressure_threshold: u64,

    /// Reject registrations that would create a dependency cycle
    pub validate_dependencies: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_services: 100,
            restart_settle_delay: Duration::from_secs(1),
            dispose_timeout: Duration::from_secs(30),
            health_check_timeout: None,
            memory_pressure_threshold: 1024 * 1024 * 1024, // 1 GiB
            validate_dependencies: true,
        }
    }
}

impl ManagerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Configuration(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&contents)
            .map_err(|e| Error::Configuration(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), contents)
            .map_err(|e| Error::Configuration(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_services == 0 {
            return Err(Error::Configuration(
                "max_services must be at least 1".to_string(),
            ));
        }

        if self.dispose_timeout.is_zero() {
            return Err(Error::Configuration(
                "dispose_timeout must be greater than zero".to_string(),
            ));
        }

        if self.health_check_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Configuration(
                "health_check_timeout must be greater than zero when set".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.max_services, 100);
        assert_eq!(config.restart_settle_delay, Duration::from_secs(1));
        assert_eq!(config.memory_pressure_threshold, 1 << 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ManagerConfig::default();
        config.max_services = 0;
        assert!(config.validate().is_err());

        config.max_services = 10;
        config.health_check_timeout = Some(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ManagerConfig = toml::from_str(
            r#"
            max_services = 12
            restart_settle_delay = "250ms"
            health_check_timeout = "5s"
            "#,
        )
        .unwrap();

        assert_eq!(config.max_services, 12);
        assert_eq!(config.restart_settle_delay, Duration::from_millis(250));
        assert_eq!(config.health_check_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.dispose_timeout, Duration::from_secs(30));
        assert!(config.validate_dependencies);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stagehand.toml");

        let config = ManagerConfig {
            max_services: 8,
            restart_settle_delay: Duration::from_millis(10),
            ..ManagerConfig::default()
        };
        config.to_file(&path).unwrap();

        assert_eq!(ManagerConfig::from_file(&path).unwrap(), config);
    }
}
