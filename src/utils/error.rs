use thiserror::Error;

#[derive(Error, Debug)]
pub enum StolonError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Missing configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Invalid value for {field} ({value}): {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Unknown environment: {name}")]
    UnknownEnvironment { name: String },

    #[error("Service '{service}' is not configured for {environment}")]
    UnknownService {
        environment: String,
        service: String,
    },

    #[error("Required tool '{tool}' was not found on PATH")]
    ToolNotFound { tool: String },

    #[error("Failed to start {name}: {reason}")]
    TunnelStartFailed {
        name: String,
        reason: String,
        output: Vec<String>,
    },

    #[error("Secret from {source_name} is unavailable: {message}")]
    SecretUnavailable {
        source_name: String,
        message: String,
    },

    #[error("Invalid statement: {message}")]
    InvalidStatement { message: String },

    #[error("Writes are not allowed against {environment}")]
    WriteNotAllowed { environment: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Approval request {id} has expired")]
    ApprovalExpired { id: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Validation,
    Tooling,
    Tunnel,
    Secret,
    Database,
    Network,
    Approval,
    Lookup,
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl StolonError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StolonError::IoError(_) => ErrorCategory::Io,
            StolonError::HttpError(_) => ErrorCategory::Network,
            StolonError::DatabaseError(_) => ErrorCategory::Database,
            StolonError::SerializationError(_) => ErrorCategory::Validation,
            StolonError::ConfigError { .. }
            | StolonError::MissingConfigError { .. }
            | StolonError::InvalidConfigValueError { .. }
            | StolonError::UnknownEnvironment { .. }
            | StolonError::UnknownService { .. } => ErrorCategory::Configuration,
            StolonError::ToolNotFound { .. } => ErrorCategory::Tooling,
            StolonError::TunnelStartFailed { .. } => ErrorCategory::Tunnel,
            StolonError::SecretUnavailable { .. } => ErrorCategory::Secret,
            StolonError::InvalidStatement { .. } | StolonError::ValidationError { .. } => {
                ErrorCategory::Validation
            }
            StolonError::NotFound { .. } => ErrorCategory::Lookup,
            StolonError::WriteNotAllowed { .. }
            | StolonError::InvalidState { .. }
            | StolonError::ApprovalExpired { .. } => ErrorCategory::Approval,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Validation | ErrorCategory::Approval | ErrorCategory::Lookup => {
                ErrorSeverity::Low
            }
            ErrorCategory::Network | ErrorCategory::Database => ErrorSeverity::Medium,
            ErrorCategory::Tunnel | ErrorCategory::Secret | ErrorCategory::Tooling => {
                ErrorSeverity::High
            }
            ErrorCategory::Configuration | ErrorCategory::Io => ErrorSeverity::Critical,
        }
    }

    /// Short message suitable for the terminal, without nested source chains.
    pub fn user_friendly_message(&self) -> String {
        match self {
            StolonError::TunnelStartFailed { name, reason, .. } => {
                format!("Could not start {}: {}", name, reason)
            }
            StolonError::ToolNotFound { tool } => format!("'{}' is not installed", tool),
            StolonError::SecretUnavailable { source_name, .. } => {
                format!("Could not read a secret from {}", source_name)
            }
            StolonError::DatabaseError(_) => "The database query failed".to_string(),
            StolonError::HttpError(_) => "The internal API request failed".to_string(),
            other => other.to_string(),
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            StolonError::ToolNotFound { .. } => {
                "Install the tool or point [tools] in stolon.toml at its location"
            }
            StolonError::TunnelStartFailed { .. } => {
                "Check your kubectl context and gcloud credentials, then retry"
            }
            StolonError::SecretUnavailable { .. } => {
                "Sign in with `op signin` or `pybritive login` and retry"
            }
            StolonError::UnknownEnvironment { .. } | StolonError::UnknownService { .. } => {
                "Check the [environments] tables in stolon.toml"
            }
            StolonError::ConfigError { .. }
            | StolonError::MissingConfigError { .. }
            | StolonError::InvalidConfigValueError { .. } => "Fix stolon.toml and try again",
            StolonError::InvalidStatement { .. } => {
                "Send one statement; writes go through the write-query flow"
            }
            StolonError::WriteNotAllowed { .. } => "Run the write against another environment",
            StolonError::ApprovalExpired { .. } => "Submit the write again",
            StolonError::NotFound { .. } => "Run `stolon ps` to see what is running",
            StolonError::DatabaseError(_) => "Check the SQL and that the proxy is running",
            _ => "Run with --verbose for more detail",
        }
    }
}

pub type Result<T> = std::result::Result<T, StolonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_and_severity() {
        let err = StolonError::ToolNotFound {
            tool: "kubectl".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Tooling);
        assert_eq!(err.severity(), ErrorSeverity::High);
        assert!(err.user_friendly_message().contains("kubectl"));

        let err = StolonError::InvalidStatement {
            message: "empty".to_string(),
        };
        assert_eq!(err.severity(), ErrorSeverity::Low);
    }

    #[test]
    fn test_not_found_is_a_lookup_failure() {
        let err = StolonError::NotFound {
            what: "process 'port-forward:dev:billing'".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Lookup);
        assert_ne!(err.category(), ErrorCategory::Approval);
        assert_eq!(err.severity(), ErrorSeverity::Low);
    }

    #[test]
    fn test_tunnel_message_hides_output() {
        let err = StolonError::TunnelStartFailed {
            name: "cloud-sql-proxy:dev".to_string(),
            reason: "exited before becoming ready".to_string(),
            output: vec!["secret-ish line".to_string()],
        };
        let message = err.user_friendly_message();
        assert!(message.contains("cloud-sql-proxy:dev"));
        assert!(!message.contains("secret-ish"));
    }
}
