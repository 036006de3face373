use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use rendezvous_shared::{CryptoError, WireError};

/// Every failure a request can surface. Validators raise these, handlers
/// propagate them unchanged, and the HTTP adapter maps each kind to its
/// status code.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Resource not available: {0}")]
    ResourceNotAvailable(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Resource already exists: {0}")]
    ResourceAlreadyExists(String),

    #[error("Request outdated")]
    RequestOutdated,

    #[error("Invalid key upload: {0}")]
    InvalidKeyUpload(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            ServerError::ResourceNotAvailable(_) => StatusCode::NOT_FOUND,
            ServerError::InvalidSignature => StatusCode::NOT_ACCEPTABLE,
            ServerError::ResourceAlreadyExists(_) => StatusCode::CONFLICT,
            ServerError::RequestOutdated => StatusCode::GONE,
            ServerError::InvalidKeyUpload(_) => StatusCode::PRECONDITION_FAILED,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn io(context: &str, err: std::io::Error) -> Self {
        ServerError::Internal(format!("{context}: {err}"))
    }
}

impl From<WireError> for ServerError {
    fn from(err: WireError) -> Self {
        ServerError::InvalidRequest(err.to_string())
    }
}

impl From<CryptoError> for ServerError {
    fn from(_: CryptoError) -> Self {
        ServerError::InvalidSignature
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed internally");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ServerError::InvalidRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServerError::AuthenticationFailed.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ServerError::ResourceNotAvailable("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServerError::InvalidSignature.status(),
            StatusCode::NOT_ACCEPTABLE
        );
        assert_eq!(
            ServerError::ResourceAlreadyExists("x".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(ServerError::RequestOutdated.status(), StatusCode::GONE);
        assert_eq!(
            ServerError::InvalidKeyUpload("x".into()).status(),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            ServerError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
