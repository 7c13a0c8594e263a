//! ESM Configuration
//!
//! YAML `esm:` section:
//!
//! ```yaml
//! esm:
//!   max_pdn_connections: 4
//!   timer:
//!     t3485: 8
//!     t3486: 8
//!     t3495: 8
//!     max_retries: 4
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;

use crate::context::{ESM_DATA_EPS_BEARER_TOTAL, ESM_DEFAULT_MAX_PDN_CONNECTIONS};
use crate::ebr_timer::EsmTimerId;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default value of T3485, T3486 and T3495 in seconds (TS 24.301 Table 10.3.1)
pub const ESM_DEFAULT_TIMER_SECS: u64 = 8;

/// Default number of retransmissions before a procedure is abandoned
pub const ESM_DEFAULT_MAX_RETRIES: u32 = 4;

/// Retransmission timer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EsmTimerConfig {
    /// T3485 in seconds
    pub t3485: u64,
    /// T3486 in seconds
    pub t3486: u64,
    /// T3495 in seconds
    pub t3495: u64,
    /// Retransmissions per procedure
    pub max_retries: u32,
}

impl Default for EsmTimerConfig {
    fn default() -> Self {
        Self {
            t3485: ESM_DEFAULT_TIMER_SECS,
            t3486: ESM_DEFAULT_TIMER_SECS,
            t3495: ESM_DEFAULT_TIMER_SECS,
            max_retries: ESM_DEFAULT_MAX_RETRIES,
        }
    }
}

impl EsmTimerConfig {
    /// Timer duration
    pub fn duration(&self, timer_id: EsmTimerId) -> Duration {
        let secs = match timer_id {
            EsmTimerId::T3485 => self.t3485,
            EsmTimerId::T3486 => self.t3486,
            EsmTimerId::T3495 => self.t3495,
        };
        Duration::from_secs(secs)
    }
}

/// ESM configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EsmConfig {
    /// Simultaneous PDN connections per UE
    pub max_pdn_connections: usize,
    pub timer: EsmTimerConfig,
}

impl Default for EsmConfig {
    fn default() -> Self {
        Self {
            max_pdn_connections: ESM_DEFAULT_MAX_PDN_CONNECTIONS,
            timer: EsmTimerConfig::default(),
        }
    }
}

impl EsmConfig {
    /// Parse the `esm` section of a YAML document. A document without one
    /// yields the defaults.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let yaml: Value =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let config = match yaml.get("esm") {
            Some(section) => serde_yaml::from_value::<EsmConfig>(section.clone())
                .map_err(|e| ConfigError::ParseError(e.to_string()))?,
            None => {
                log::warn!("No 'esm' section in config file");
                EsmConfig::default()
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file. A missing file yields the
    /// defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        log::info!("Loading configuration from: {}", path.display());

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!(
                    "Could not read config file '{}': {}. Using defaults.",
                    path.display(),
                    e
                );
                return Ok(EsmConfig::default());
            }
            Err(e) => return Err(e.into()),
        };

        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pdn_connections == 0 || self.max_pdn_connections > ESM_DATA_EPS_BEARER_TOTAL {
            return Err(ConfigError::ValidationError(format!(
                "`max_pdn_connections` must be within 1..={}, got {}",
                ESM_DATA_EPS_BEARER_TOTAL, self.max_pdn_connections
            )));
        }
        for (name, secs) in [
            ("t3485", self.timer.t3485),
            ("t3486", self.timer.t3486),
            ("t3495", self.timer.t3495),
        ] {
            if secs == 0 {
                return Err(ConfigError::ValidationError(format!("`timer.{}` must not be 0", name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EsmConfig::default();
        assert_eq!(config.max_pdn_connections, 4);
        assert_eq!(config.timer.max_retries, 4);
        assert_eq!(config.timer.duration(EsmTimerId::T3485), Duration::from_secs(8));
        assert_eq!(config.timer.duration(EsmTimerId::T3486), Duration::from_secs(8));
        assert_eq!(config.timer.duration(EsmTimerId::T3495), Duration::from_secs(8));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_str() {
        let yaml = r#"
logger:
  level: info
esm:
  max_pdn_connections: 2
  timer:
    t3485: 4
    t3495: 6
    max_retries: 3
"#;
        let config = EsmConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.max_pdn_connections, 2);
        assert_eq!(config.timer.t3485, 4);
        assert_eq!(config.timer.t3486, ESM_DEFAULT_TIMER_SECS);
        assert_eq!(config.timer.t3495, 6);
        assert_eq!(config.timer.max_retries, 3);
    }

    #[test]
    fn test_missing_section_defaults() {
        let config = EsmConfig::from_yaml_str("mme:\n  relative_capacity: 255\n").unwrap();
        assert_eq!(config, EsmConfig::default());
    }

    #[test]
    fn test_parse_error() {
        let result = EsmConfig::from_yaml_str("esm:\n  max_pdn_connections: many\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validation_errors() {
        let result = EsmConfig::from_yaml_str("esm:\n  max_pdn_connections: 12\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));

        let result = EsmConfig::from_yaml_str("esm:\n  max_pdn_connections: 0\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));

        let result = EsmConfig::from_yaml_str("esm:\n  timer:\n    t3486: 0\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let config = EsmConfig::load("/nonexistent/nextgcore/esmd.yaml").unwrap();
        assert_eq!(config, EsmConfig::default());
    }
}
