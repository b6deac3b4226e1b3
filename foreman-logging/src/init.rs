use anyhow::Result;
use foreman_config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Build an env filter from a level or directive string.
///
/// An unparsable value falls back to `RUST_LOG`, then to `info`.
pub fn build_env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_new(log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize host logging from configuration.
///
/// Output goes to stderr so stdout stays free for command results.
pub fn init_logging_from_config(config: &LoggingConfig) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(&config.filter_directive()))
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_writer(std::io::stderr);

    // Use try_init to avoid panic if global subscriber already set
    let result = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Text => builder.try_init(),
    };

    if result.is_err() {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize plain text tracing on stderr from a level or directive string
pub fn init_simple_tracing(log_level: &str) -> Result<()> {
    if tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(log_level))
        .with_writer(std::io::stderr)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize tracing for worker processes (output to stderr to avoid IPC conflicts)
pub fn init_worker_tracing(log_level: Option<&str>) -> Result<()> {
    let env_filter = match log_level {
        Some(level) => build_env_filter(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_config::LogLevel;

    #[test]
    fn test_build_env_filter_accepts_directives() {
        let filter = build_env_filter("foreman_execution=debug,info");
        assert!(filter.to_string().contains("foreman_execution=debug"));
    }

    #[test]
    fn test_repeated_initialisation_is_harmless() {
        let config = LoggingConfig {
            level: LogLevel::Debug,
            format: LogFormat::Json,
            directives: vec!["foreman_ipc=trace".to_string()],
            source_location: true,
        };

        assert!(init_logging_from_config(&config).is_ok());
        assert!(init_logging_from_config(&config).is_ok());
        assert!(init_simple_tracing("warn").is_ok());
        assert!(init_worker_tracing(Some("error")).is_ok());
    }
}
