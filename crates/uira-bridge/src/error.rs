use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::classify::{classify_failure, ErrorCategory, ErrorClassification};
use crate::types::{ErrorBody, ErrorDetail};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to stage prompt for stdin: {0}")]
    Staging(#[source] std::io::Error),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("{}", .0.message)]
    Agent(ErrorClassification),

    #[error("failed to parse agent output: {0}")]
    Parse(String),
}

impl BridgeError {
    pub fn classification(&self) -> ErrorClassification {
        match self {
            Self::InvalidRequest(message) => {
                ErrorClassification::new(ErrorCategory::InvalidRequest, message.clone())
            }
            Self::Launch(LaunchError::Staging(e)) => {
                ErrorClassification::new(ErrorCategory::ServerError, e.to_string())
            }
            Self::Launch(e @ LaunchError::Spawn { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                ErrorClassification::with_detail(ErrorCategory::BinaryNotFound, &e.to_string())
            }
            Self::Launch(e) => classify_failure(&e.to_string()),
            Self::Agent(classification) => classification.clone(),
            Self::Parse(detail) => ErrorClassification::with_detail(ErrorCategory::ParseError, detail),
        }
    }
}

/// Build an OpenAI-style `{error: {message, type, code}}` response.
pub fn error_response(status: StatusCode, category: ErrorCategory, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        error: ErrorDetail {
            message: message.into(),
            kind: category.as_str().to_string(),
            code: category.as_str().to_string(),
        },
    };
    (status, Json(body)).into_response()
}

impl IntoResponse for ErrorClassification {
    fn into_response(self) -> Response {
        error_response(self.status, self.category, self.message)
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        self.classification().into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_request_maps_to_400() {
        let err = BridgeError::InvalidRequest("messages must not be empty".to_string());
        let c = err.classification();
        assert_eq!(c.status, StatusCode::BAD_REQUEST);
        assert_eq!(c.category, ErrorCategory::InvalidRequest);
        assert_eq!(c.message, "messages must not be empty");
    }

    #[test]
    fn test_missing_binary_is_classified() {
        let err = BridgeError::Launch(LaunchError::Spawn {
            program: "/nonexistent/gemini".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
        assert_eq!(err.classification().category, ErrorCategory::BinaryNotFound);
    }

    #[test]
    fn test_parse_error_maps_to_502() {
        let err = BridgeError::Parse("expected value at line 1 column 1".to_string());
        let c = err.classification();
        assert_eq!(c.category, ErrorCategory::ParseError);
        assert_eq!(c.status, StatusCode::BAD_GATEWAY);
    }
}
