//! Command dispatch configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_at_most, validate_positive, Validatable};

/// Upper bound accepted for `max_line_length` (64 MiB)
const MAX_LINE_LENGTH_CEILING: usize = 64 * 1024 * 1024;

/// Timeouts and limits applied to every worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Timeout applied when a caller does not supply one
    #[serde(with = "crate::domains::utils::serde_duration", default = "default_timeout")]
    pub default_timeout: Duration,

    /// Deadline for the `ping` handshake sent while pre-warming a category
    #[serde(
        rename = "handshake_timeout_ms",
        with = "crate::domains::utils::serde_duration_millis",
        default = "default_handshake_timeout"
    )]
    pub handshake_timeout: Duration,

    /// How long a freshly spawned process must stay up before it is trusted
    #[serde(
        rename = "startup_grace_ms",
        with = "crate::domains::utils::serde_duration_millis",
        default = "default_startup_grace"
    )]
    pub startup_grace: Duration,

    /// Deadline for the best-effort `shutdown` command
    #[serde(
        rename = "shutdown_command_timeout_ms",
        with = "crate::domains::utils::serde_duration_millis",
        default = "default_shutdown_command_timeout"
    )]
    pub shutdown_command_timeout: Duration,

    /// Time a worker gets to exit on its own before it is terminated
    #[serde(
        rename = "shutdown_grace_ms",
        with = "crate::domains::utils::serde_duration_millis",
        default = "default_shutdown_grace"
    )]
    pub shutdown_grace: Duration,

    /// Time allowed after a forced kill for the process to be reaped
    #[serde(
        rename = "kill_timeout_ms",
        with = "crate::domains::utils::serde_duration_millis",
        default = "default_kill_timeout"
    )]
    pub kill_timeout: Duration,

    /// Longest accepted response line, in bytes
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// Number of stderr lines kept per worker for crash diagnostics
    #[serde(default = "default_stderr_buffer_lines")]
    pub stderr_buffer_lines: usize,

    /// Interval between health sweeps of the worker pool
    #[serde(with = "crate::domains::utils::serde_duration", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_timeout(),
            handshake_timeout: default_handshake_timeout(),
            startup_grace: default_startup_grace(),
            shutdown_command_timeout: default_shutdown_command_timeout(),
            shutdown_grace: default_shutdown_grace(),
            kill_timeout: default_kill_timeout(),
            max_line_length: default_max_line_length(),
            stderr_buffer_lines: default_stderr_buffer_lines(),
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

impl Validatable for DispatchConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.default_timeout.as_secs(), "default_timeout", self.domain_name())?;
        validate_positive(
            self.handshake_timeout.as_millis(),
            "handshake_timeout_ms",
            self.domain_name(),
        )?;
        validate_positive(
            self.shutdown_command_timeout.as_millis(),
            "shutdown_command_timeout_ms",
            self.domain_name(),
        )?;
        validate_positive(self.kill_timeout.as_millis(), "kill_timeout_ms", self.domain_name())?;
        validate_positive(
            self.heartbeat_interval.as_secs(),
            "heartbeat_interval",
            self.domain_name(),
        )?;

        validate_positive(self.max_line_length, "max_line_length", self.domain_name())?;
        validate_at_most(
            self.max_line_length,
            MAX_LINE_LENGTH_CEILING,
            "max_line_length",
            self.domain_name(),
        )?;

        validate_positive(self.stderr_buffer_lines, "stderr_buffer_lines", self.domain_name())?;

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "dispatch"
    }
}

// Default value functions
fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_handshake_timeout() -> Duration {
    Duration::from_millis(5_000)
}

fn default_startup_grace() -> Duration {
    Duration::from_millis(250)
}

fn default_shutdown_command_timeout() -> Duration {
    Duration::from_millis(2_000)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_millis(3_000)
}

fn default_kill_timeout() -> Duration {
    Duration::from_millis(5_000)
}

fn default_max_line_length() -> usize {
    8 * 1024 * 1024 // 8MB
}

fn default_stderr_buffer_lines() -> usize {
    64
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(15)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_config_defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.default_timeout, Duration::from_secs(30));
        assert_eq!(config.startup_grace, Duration::from_millis(250));
        assert_eq!(config.max_line_length, 8 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dispatch_config_validation() {
        let mut config = DispatchConfig::default();
        config.default_timeout = Duration::from_secs(0);
        assert!(config.validate().is_err());

        let mut config = DispatchConfig::default();
        config.max_line_length = MAX_LINE_LENGTH_CEILING + 1;
        assert!(config.validate().is_err());

        let mut config = DispatchConfig::default();
        config.stderr_buffer_lines = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_startup_grace_is_allowed() {
        let config = DispatchConfig {
            startup_grace: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_millisecond_fields_from_yaml() {
        let yaml = "default_timeout: 5\nstartup_grace_ms: 40\nkill_timeout_ms: 900\n";
        let config: DispatchConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.default_timeout, Duration::from_secs(5));
        assert_eq!(config.startup_grace, Duration::from_millis(40));
        assert_eq!(config.kill_timeout, Duration::from_millis(900));
        assert_eq!(config.handshake_timeout, Duration::from_millis(5_000));
    }
}
