use crate::error::Error;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tracing::error;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    backend: Option<String>,
}

/// Errors returned by the HTTP handlers
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
    Core(Error),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Core(e)
    }
}

fn core_status(err: &Error) -> (StatusCode, String) {
    match err.root() {
        Error::AuthExpired { credential_id } => (
            StatusCode::UNAUTHORIZED,
            format!("reconnect required for credential '{}'", credential_id),
        ),
        Error::NotFound(_) | Error::CredentialNotFound(_) => {
            (StatusCode::NOT_FOUND, err.root().to_string())
        }
        Error::ClassificationInput { .. } | Error::ObjectTooLarge { .. } => {
            (StatusCode::PAYLOAD_TOO_LARGE, err.root().to_string())
        }
        Error::TransientBackend(_) => (StatusCode::SERVICE_UNAVAILABLE, err.root().to_string()),
        Error::Unauthorized | Error::BackendRejected { .. } => {
            (StatusCode::BAD_GATEWAY, err.root().to_string())
        }
        Error::Cancelled => (StatusCode::REQUEST_TIMEOUT, err.root().to_string()),
        Error::Integrity(_) => {
            error!(error = %err, "Credential integrity failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "stored credential failed its integrity check".to_string(),
            )
        }
        Error::Config(_)
        | Error::Database(_)
        | Error::Io(_)
        | Error::Serialization(_)
        | Error::Backend { .. } => {
            error!(error = %err, "Internal error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            )
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message, backend) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            ApiError::Internal(msg) => {
                error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                    None,
                )
            }
            ApiError::Core(err) => {
                let (status, msg) = core_status(&err);
                (status, msg, err.backend().map(|b| b.to_string()))
            }
        };

        let body = Json(ErrorResponse {
            error: error_message,
            backend,
        });

        (status, body).into_response()
    }
}
