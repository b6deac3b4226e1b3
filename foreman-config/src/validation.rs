//! Configuration validation traits and utilities

use crate::error::{ConfigError, ConfigResult};

/// Trait for validatable configuration
pub trait Validatable {
    /// Validate the configuration
    fn validate(&self) -> ConfigResult<()>;

    /// Get the domain name for error reporting
    fn domain_name(&self) -> &'static str;

    /// Helper to create a domain-specific validation error
    fn validation_error(&self, message: impl Into<String>) -> ConfigError {
        invalid(self.domain_name(), message)
    }
}

fn invalid(domain: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        domain,
        message: message.into(),
    }
}

/// Validate a required string field
pub fn validate_required_string(
    value: &str,
    field_name: &str,
    domain: &'static str,
) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(invalid(domain, format!("{} cannot be empty", field_name)));
    }
    Ok(())
}

/// Validate a positive number
pub fn validate_positive<T>(value: T, field_name: &str, domain: &'static str) -> ConfigResult<()>
where
    T: PartialOrd + Default + std::fmt::Display,
{
    if value <= T::default() {
        return Err(invalid(
            domain,
            format!("{} must be greater than 0, got {}", field_name, value),
        ));
    }
    Ok(())
}

/// Validate that `value` does not exceed `limit`
pub fn validate_at_most<T>(
    value: T,
    limit: T,
    field_name: &str,
    domain: &'static str,
) -> ConfigResult<()>
where
    T: PartialOrd + std::fmt::Display,
{
    if value > limit {
        return Err(invalid(
            domain,
            format!("{} must be at most {}, got {}", field_name, limit, value),
        ));
    }
    Ok(())
}

/// Validate a single token: non-empty and free of whitespace.
///
/// Used for worker category names and log filter directives.
pub fn validate_token(value: &str, field_name: &str, domain: &'static str) -> ConfigResult<()> {
    validate_required_string(value, field_name, domain)?;

    if value.trim().chars().any(char::is_whitespace) {
        return Err(invalid(
            domain,
            format!("{} entry '{}' must not contain whitespace", field_name, value),
        ));
    }
    Ok(())
}
