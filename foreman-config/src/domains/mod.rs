//! Domain-specific configuration modules

pub mod dispatch;
pub mod logging;
pub mod utils;
pub mod workers;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main Foreman configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ForemanConfig {
    /// Timeouts and limits for command dispatch
    #[serde(default)]
    pub dispatch: dispatch::DispatchConfig,

    /// Worker process launch settings
    #[serde(default)]
    pub workers: workers::WorkersConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: logging::LoggingConfig,
}

impl ForemanConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.dispatch.validate()?;
        self.workers.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = ForemanConfig::default();
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_config_parses_back() {
        let sample = ForemanConfig::generate_sample();
        let parsed: ForemanConfig = serde_yaml::from_str(&sample).unwrap();

        assert!(parsed.validate_all().is_ok());
        assert_eq!(parsed.dispatch.max_line_length, 8 * 1024 * 1024);
        assert!(sample.contains("startup_grace_ms"));
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let parsed: ForemanConfig = serde_yaml::from_str("{}").unwrap();
        assert!(parsed.workers.restart_on_crash);
        assert_eq!(parsed.dispatch.stderr_buffer_lines, 64);
    }
}
