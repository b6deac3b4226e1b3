//! Configuration loading and environment variable handling

use crate::domains::ForemanConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "FOREMAN".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<ForemanConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: ForemanConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<ForemanConfig> {
        let mut config = ForemanConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<ForemanConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut ForemanConfig) -> ConfigResult<()> {
        self.apply_dispatch_overrides(&mut config.dispatch)?;
        self.apply_workers_overrides(&mut config.workers)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply dispatch config overrides
    fn apply_dispatch_overrides(
        &self,
        config: &mut crate::domains::dispatch::DispatchConfig,
    ) -> ConfigResult<()> {
        if let Ok(timeout) = self.get_env_var("DEFAULT_TIMEOUT_SECONDS") {
            let seconds: u64 = parse_env("DEFAULT_TIMEOUT_SECONDS", &timeout)?;
            config.default_timeout = Duration::from_secs(seconds);
        }

        if let Ok(max) = self.get_env_var("MAX_LINE_LENGTH") {
            config.max_line_length = parse_env("MAX_LINE_LENGTH", &max)?;
        }

        Ok(())
    }

    /// Apply worker launch overrides
    fn apply_workers_overrides(
        &self,
        config: &mut crate::domains::workers::WorkersConfig,
    ) -> ConfigResult<()> {
        if let Ok(executable) = self.get_env_var("WORKER_EXECUTABLE") {
            config.executable = PathBuf::from(executable);
        }

        if let Ok(script) = self.get_env_var("WORKER_SCRIPT") {
            config.script = if script.is_empty() {
                None
            } else {
                Some(PathBuf::from(script))
            };
        }

        if let Ok(dir) = self.get_env_var("WORKER_DIR") {
            config.working_directory = Some(PathBuf::from(dir));
        }

        if let Ok(prewarm) = self.get_env_var("PREWARM") {
            config.prewarm = split_list(&prewarm);
        }

        if let Ok(restart) = self.get_env_var("RESTART_ON_CRASH") {
            config.restart_on_crash = parse_env("RESTART_ON_CRASH", &restart)?;
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(
        &self,
        config: &mut crate::domains::logging::LoggingConfig,
    ) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = parse_env("LOG_LEVEL", &log_level)?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = parse_env("LOG_FORMAT", &format)?;
        }

        if let Ok(directives) = self.get_env_var("LOG_DIRECTIVES") {
            config.directives = split_list(&directives);
        }

        Ok(())
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_env<T>(name: &str, raw: &str) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        var: name.to_string(),
        message: e.to_string(),
    })
}

/// Comma-separated list, blanks dropped
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
