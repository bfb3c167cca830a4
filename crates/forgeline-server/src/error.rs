//! Unified error handling for the API

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use forgeline_core::RegistryError;

/// API error response body
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
}

/// Application error types
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    /// The request is well-formed but conflicts with the session's state,
    /// e.g. a confirmation with no pending checkpoint.
    Conflict(String),
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (code, message) = match self {
            AppError::NotFound(msg) => ("NOT_FOUND", msg),
            AppError::BadRequest(msg) => ("BAD_REQUEST", msg),
            AppError::Conflict(msg) => ("CONFLICT", msg),
            AppError::Internal(msg) => ("INTERNAL_ERROR", msg),
        };

        (
            status,
            Json(ApiError {
                error: message,
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => AppError::NotFound(err.to_string()),
            RegistryError::InvalidInput(_) => AppError::BadRequest(err.to_string()),
            RegistryError::AlreadyExists(_)
            | RegistryError::WorkspaceBusy { .. }
            | RegistryError::Rejected(_) => AppError::Conflict(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Log full error chain for debugging, return sanitized message to client
        tracing::error!("Internal error: {:?}", err);
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeline_core::RendezvousError;

    #[test]
    fn registry_errors_map_to_statuses() {
        let cases = [
            (RegistryError::NotFound("s".into()), StatusCode::NOT_FOUND),
            (RegistryError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (RegistryError::AlreadyExists("s".into()), StatusCode::CONFLICT),
            (
                RegistryError::Rejected(RendezvousError::NoPendingCheckpoint),
                StatusCode::CONFLICT,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status(), status);
        }
    }
}
