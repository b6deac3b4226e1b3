//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML for [`ForemanConfig`](crate::ForemanConfig)
    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// An environment override could not be parsed
    #[error("Invalid value for {var}: {message}")]
    Env { var: String, message: String },

    /// A value is out of range for its domain
    #[error("Invalid {domain} configuration: {message}")]
    Invalid {
        domain: &'static str,
        message: String,
    },
}

impl ConfigError {
    /// Domain the error belongs to, when it came from validation
    pub fn domain(&self) -> Option<&'static str> {
        match self {
            ConfigError::Invalid { domain, .. } => Some(domain),
            _ => None,
        }
    }
}
