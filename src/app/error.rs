// Maps StolonError onto HTTP responses for the local API.

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde::Serialize;

use crate::utils::error::StolonError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub category: String,
    pub suggestion: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<String>,
}

impl actix_web::error::ResponseError for StolonError {
    fn status_code(&self) -> StatusCode {
        match self {
            StolonError::InvalidStatement { .. }
            | StolonError::ValidationError { .. }
            | StolonError::SerializationError(_) => StatusCode::BAD_REQUEST,
            StolonError::DatabaseError(sqlx::Error::Database(_)) => StatusCode::BAD_REQUEST,
            StolonError::UnknownEnvironment { .. }
            | StolonError::UnknownService { .. }
            | StolonError::NotFound { .. } => StatusCode::NOT_FOUND,
            StolonError::WriteNotAllowed { .. } => StatusCode::FORBIDDEN,
            StolonError::InvalidState { .. } => StatusCode::CONFLICT,
            StolonError::ApprovalExpired { .. } => StatusCode::GONE,
            StolonError::ToolNotFound { .. }
            | StolonError::TunnelStartFailed { .. }
            | StolonError::SecretUnavailable { .. }
            | StolonError::HttpError(_)
            | StolonError::DatabaseError(_) => StatusCode::BAD_GATEWAY,
            StolonError::ConfigError { .. }
            | StolonError::MissingConfigError { .. }
            | StolonError::InvalidConfigValueError { .. }
            | StolonError::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let output = match self {
            StolonError::TunnelStartFailed { output, .. } => output.clone(),
            _ => Vec::new(),
        };
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.to_string(),
            category: format!("{:?}", self.category()).to_lowercase(),
            suggestion: self.recovery_suggestion(),
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::MessageBody;
    use actix_web::error::ResponseError;

    #[actix_web::test]
    async fn test_error_body() {
        let err = StolonError::ApprovalExpired {
            id: "42".to_string(),
        };
        let response = err.error_response();
        assert_eq!(response.status(), StatusCode::GONE);

        let body = response.into_body().try_into_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["category"], "approval");
        assert!(json["error"].as_str().unwrap().contains("42"));
        assert!(json.get("output").is_none());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            StolonError::WriteNotAllowed {
                environment: "na-prod".to_string()
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            StolonError::ToolNotFound {
                tool: "kubectl".to_string()
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            StolonError::UnknownEnvironment {
                name: "qa".to_string()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
    }
}
