//! Logging configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigResult;
use crate::validation::{validate_token, Validatable};

/// How the host process logs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Baseline level for every target
    pub level: LogLevel,

    /// Output format
    pub format: LogFormat,

    /// Per-target filter directives, e.g. `foreman_execution::handle=trace`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub directives: Vec<String>,

    /// Include file and line of the log call site
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
            directives: Vec::new(),
            source_location: false,
        }
    }
}

impl LoggingConfig {
    /// Filter string combining the level with the per-target directives
    pub fn filter_directive(&self) -> String {
        std::iter::once(self.level.as_str())
            .chain(self.directives.iter().map(|d| d.trim()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        if wanted == "warning" {
            return Ok(LogLevel::Warn);
        }
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == wanted)
            .ok_or_else(|| format!("unknown log level '{}'", s))
    }
}

/// Output format of the tracing subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
    Compact,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            "compact" => Ok(LogFormat::Compact),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(format!("unknown log format '{}'", s)),
        }
    }
}

impl Validatable for LoggingConfig {
    fn validate(&self) -> ConfigResult<()> {
        for directive in &self.directives {
            validate_token(directive, "directives", self.domain_name())?;
            if directive.contains(',') {
                return Err(self.validation_error(format!(
                    "directive '{}' must name a single target",
                    directive
                )));
            }
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "logging"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::from_str("INFO").unwrap(), LogLevel::Info);
        assert_eq!(LogLevel::from_str(" warning ").unwrap(), LogLevel::Warn);
        for level in LogLevel::ALL {
            assert_eq!(level.to_string().parse::<LogLevel>().unwrap(), level);
        }
        assert!(LogLevel::from_str("loud").is_err());
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert!(LogFormat::from_str("xml").is_err());
    }

    #[test]
    fn test_filter_directive_appends_targets() {
        let config = LoggingConfig {
            level: LogLevel::Warn,
            directives: vec!["foreman_execution=debug".into(), " foreman_ipc=trace".into()],
            ..LoggingConfig::default()
        };
        assert_eq!(
            config.filter_directive(),
            "warn,foreman_execution=debug,foreman_ipc=trace"
        );
        assert!(config.validate().is_ok());
        assert_eq!(LoggingConfig::default().filter_directive(), "info");
    }

    #[test]
    fn test_directives_are_validated() {
        let spaced = LoggingConfig {
            directives: vec!["foreman execution=debug".into()],
            ..LoggingConfig::default()
        };
        assert!(spaced.validate().is_err());

        let combined = LoggingConfig {
            directives: vec!["a=debug,b=trace".into()],
            ..LoggingConfig::default()
        };
        let err = combined.validate().unwrap_err();
        assert_eq!(err.domain(), Some("logging"));
    }
}
