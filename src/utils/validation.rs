use crate::utils::error::{Result, StolonError};

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

pub fn validate_port(field_name: &str, port: u16) -> Result<()> {
    if port == 0 {
        return Err(StolonError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: port.to_string(),
            reason: "Port must be between 1 and 65535".to_string(),
        });
    }
    Ok(())
}

pub fn validate_positive_number(field_name: &str, value: usize, min_value: usize) -> Result<()> {
    if value < min_value {
        return Err(StolonError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: format!("Value must be at least {}", min_value),
        });
    }
    Ok(())
}

pub fn validate_non_empty_string(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(StolonError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: "Value cannot be empty or whitespace-only".to_string(),
        });
    }
    Ok(())
}

pub fn validate_range<T: PartialOrd + std::fmt::Display + Copy>(
    field_name: &str,
    value: T,
    min: T,
    max: T,
) -> Result<()> {
    if value < min || value > max {
        return Err(StolonError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: format!("Value must be between {} and {}", min, max),
        });
    }
    Ok(())
}

pub fn validate_regex(field_name: &str, pattern: &str) -> Result<()> {
    regex::Regex::new(pattern).map_err(|e| StolonError::InvalidConfigValueError {
        field: field_name.to_string(),
        value: pattern.to_string(),
        reason: format!("Invalid regular expression: {}", e),
    })?;
    Ok(())
}

/// Request paths forwarded to internal APIs must be absolute and stay on the forwarded host.
pub fn validate_api_path(field_name: &str, path: &str) -> Result<()> {
    if !path.starts_with('/') || path.starts_with("//") {
        return Err(StolonError::ValidationError {
            message: format!("{} must be an absolute path, got '{}'", field_name, path),
        });
    }
    if path.contains('\0') {
        return Err(StolonError::ValidationError {
            message: format!("{} contains null bytes", field_name),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_port() {
        assert!(validate_port("server.port", 8765).is_ok());
        assert!(validate_port("server.port", 0).is_err());
    }

    #[test]
    fn test_validate_positive_number() {
        assert!(validate_positive_number("query.max_rows", 5, 1).is_ok());
        assert!(validate_positive_number("query.max_rows", 0, 1).is_err());
    }

    #[test]
    fn test_validate_range() {
        assert!(validate_range("tools.ready_timeout_seconds", 30u64, 1, 600).is_ok());
        assert!(validate_range("tools.ready_timeout_seconds", 0u64, 1, 600).is_err());
        assert!(validate_range("tools.ready_timeout_seconds", 601u64, 1, 600).is_err());
    }

    #[test]
    fn test_validate_regex() {
        assert!(validate_regex("sanitize.pii_patterns", "(?i)_email$").is_ok());
        assert!(validate_regex("sanitize.pii_patterns", "([").is_err());
    }

    #[test]
    fn test_validate_api_path() {
        assert!(validate_api_path("path", "/v1/accounts").is_ok());
        assert!(validate_api_path("path", "v1/accounts").is_err());
        assert!(validate_api_path("path", "//evil.example.com/x").is_err());
    }
}
