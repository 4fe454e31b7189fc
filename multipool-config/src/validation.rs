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
        ConfigError::DomainError {
            domain: self.domain_name().to_string(),
            message: message.into(),
        }
    }
}

/// Validate a positive number
pub fn validate_positive<T>(value: T, field_name: &str, domain: &str) -> ConfigResult<()>
where
    T: PartialOrd + Default + std::fmt::Display,
{
    if value <= T::default() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} must be greater than 0, got {}", field_name, value),
        });
    }
    Ok(())
}

/// Validate that a number lies in an inclusive range
pub fn validate_range<T>(value: T, min: T, max: T, field_name: &str, domain: &str) -> ConfigResult<()>
where
    T: PartialOrd + std::fmt::Display,
{
    if value < min || value > max {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!(
                "{} must be between {} and {}, got {}",
                field_name, min, max, value
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_positive() {
        assert!(validate_positive(1usize, "queue_count", "pool").is_ok());
        let err = validate_positive(0usize, "queue_count", "pool").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Domain configuration error in pool: queue_count must be greater than 0, got 0"
        );
    }

    #[test]
    fn test_validate_range() {
        assert!(validate_range(1, 1, 32, "threads", "pool").is_ok());
        assert!(validate_range(32, 1, 32, "threads", "pool").is_ok());
        assert!(validate_range(33, 1, 32, "threads", "pool").is_err());
        assert!(validate_range(0, 1, 32, "threads", "pool").is_err());
    }
}
